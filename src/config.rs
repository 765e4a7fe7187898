use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the controller-supplied JSON config blob.
///
/// This is the contract the desktop shell produces when it spawns a tool; CLI
/// flags override individual fields for manual runs.
pub const TOOL_CONFIG_ENV: &str = "TOOL_CONFIG";

/// Map from a logical field name ("key", "postUrl", ...) to the input column
/// that carries it. Tools fall back to their conventional column names when a
/// field is not mapped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColumnMap(BTreeMap<String, String>);

impl ColumnMap {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    /// Resolve a logical field to an input column name.
    pub fn column<'a>(&'a self, logical: &str, default: &'a str) -> &'a str {
        self.0.get(logical).map(String::as_str).unwrap_or(default)
    }
}

/// The JSON blob carried in `TOOL_CONFIG`.
///
/// Every field is optional here; required-ness is enforced after the merge so
/// a field may come from either the blob or a CLI flag.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolConfigBlob {
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub credentials_path: Option<PathBuf>,
    pub tool_id: Option<String>,
    pub per_credential_limit: Option<u32>,
    pub max_concurrent: Option<usize>,
    pub max_requests_per_second: Option<u32>,
    pub retry_max: Option<u32>,
    pub batch_size: Option<u32>,
    pub call_timeout_seconds: Option<u64>,
    pub column_map: Option<BTreeMap<String, String>>,
    pub stop_flag_path: Option<PathBuf>,
    pub api_base_url: Option<String>,
    pub dry_run: Option<bool>,
}

/// Fully resolved job configuration.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub credentials_path: PathBuf,
    pub tool_id: String,

    /// Initial credit quota for credentials seeded this run.
    pub per_credential_limit: u32,

    /// Global in-flight cap across workers.
    pub max_concurrent: usize,

    /// Token-bucket rate (requests per second) shared by all workers.
    pub max_requests_per_second: u32,

    /// Transient-retry attempts inside the driver.
    pub retry_max: u32,

    /// Items per request for tools whose driver batches.
    pub batch_size: u32,

    /// Wall-clock ceiling for a single driver call.
    pub call_timeout: Duration,

    pub column_map: ColumnMap,

    /// Optional sentinel file; its existence means "begin cancel".
    pub stop_flag_path: Option<PathBuf>,

    pub api_base_url: String,

    /// Read and map rows but never call the driver or write anything.
    pub dry_run: bool,
}

/// CLI-side overrides, mirroring the blob field-for-field. `main` builds this
/// from clap; tests build it directly.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub credentials_path: Option<PathBuf>,
    pub tool_id: Option<String>,
    pub per_credential_limit: Option<u32>,
    pub max_concurrent: Option<usize>,
    pub max_requests_per_second: Option<u32>,
    pub retry_max: Option<u32>,
    pub batch_size: Option<u32>,
    pub call_timeout_seconds: Option<u64>,
    pub column_map_json: Option<String>,
    pub stop_flag_path: Option<PathBuf>,
    pub api_base_url: Option<String>,
    pub dry_run: bool,
}

pub const DEFAULT_PER_CREDENTIAL_LIMIT: u32 = 2500;
pub const DEFAULT_MAX_CONCURRENT: usize = 10;
pub const DEFAULT_MAX_REQUESTS_PER_SECOND: u32 = 4;
pub const DEFAULT_RETRY_MAX: u32 = 5;
pub const DEFAULT_BATCH_SIZE: u32 = 1;
pub const DEFAULT_CALL_TIMEOUT_SECONDS: u64 = 120;
pub const DEFAULT_API_BASE_URL: &str = "https://actors.leadgrid.app/v2";

impl JobConfig {
    /// Merge three ordered sources, later overriding earlier: hard-coded
    /// defaults, the `TOOL_CONFIG` env blob, CLI flags.
    pub fn resolve(cli: CliOverrides, env_blob: Option<&str>) -> Result<Self> {
        let blob: ToolConfigBlob = match env_blob {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)
                .wrap_err_with(|| format!("failed to parse {TOOL_CONFIG_ENV} JSON"))?,
            _ => ToolConfigBlob::default(),
        };

        let cli_column_map: Option<BTreeMap<String, String>> = match cli.column_map_json {
            Some(raw) => Some(
                serde_json::from_str(&raw).wrap_err("failed to parse --column-map JSON")?,
            ),
            None => None,
        };

        let input_path = cli
            .input_path
            .or(blob.input_path)
            .ok_or_else(|| eyre!("missing required option inputPath"))?;
        let output_path = cli
            .output_path
            .or(blob.output_path)
            .ok_or_else(|| eyre!("missing required option outputPath"))?;
        let credentials_path = cli
            .credentials_path
            .or(blob.credentials_path)
            .ok_or_else(|| eyre!("missing required option credentialsPath"))?;
        let tool_id = cli
            .tool_id
            .or(blob.tool_id)
            .ok_or_else(|| eyre!("missing required option toolId"))?;

        let per_credential_limit = cli
            .per_credential_limit
            .or(blob.per_credential_limit)
            .unwrap_or(DEFAULT_PER_CREDENTIAL_LIMIT);
        let max_concurrent = cli
            .max_concurrent
            .or(blob.max_concurrent)
            .unwrap_or(DEFAULT_MAX_CONCURRENT);
        let max_requests_per_second = cli
            .max_requests_per_second
            .or(blob.max_requests_per_second)
            .unwrap_or(DEFAULT_MAX_REQUESTS_PER_SECOND);
        let retry_max = cli.retry_max.or(blob.retry_max).unwrap_or(DEFAULT_RETRY_MAX);
        let batch_size = cli.batch_size.or(blob.batch_size).unwrap_or(DEFAULT_BATCH_SIZE);
        let call_timeout_seconds = cli
            .call_timeout_seconds
            .or(blob.call_timeout_seconds)
            .unwrap_or(DEFAULT_CALL_TIMEOUT_SECONDS);

        if per_credential_limit == 0 {
            return Err(eyre!("perCredentialLimit must be > 0"));
        }
        if max_concurrent == 0 {
            return Err(eyre!("maxConcurrent must be > 0"));
        }
        if max_requests_per_second == 0 {
            return Err(eyre!("maxRequestsPerSecond must be > 0"));
        }
        if batch_size == 0 {
            return Err(eyre!("batchSize must be > 0"));
        }

        if !input_path.exists() {
            return Err(eyre!("input file {} does not exist", input_path.display()));
        }

        let column_map = ColumnMap::new(
            cli_column_map
                .or(blob.column_map)
                .unwrap_or_default(),
        );

        Ok(Self {
            input_path,
            output_path,
            credentials_path,
            tool_id,
            per_credential_limit,
            max_concurrent,
            max_requests_per_second,
            retry_max,
            batch_size,
            // Clamp the floor so a misconfigured timeout cannot spin the
            // retry loop on instantly-expiring calls.
            call_timeout: Duration::from_secs(call_timeout_seconds.max(5)),
            column_map,
            stop_flag_path: cli.stop_flag_path.or(blob.stop_flag_path),
            api_base_url: cli
                .api_base_url
                .or(blob.api_base_url)
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            dry_run: cli.dry_run || blob.dry_run.unwrap_or(false),
        })
    }
}
