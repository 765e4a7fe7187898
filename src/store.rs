use eyre::{eyre, Result, WrapErr};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const STATUS_COLUMN: &str = "Status";
pub const STATUS_DONE: &str = "done";

/// In-memory model of the input CSV: header order preserved, every row
/// padded to the header width, `Status` column tracked by index.
#[derive(Debug, Clone)]
pub struct CsvTable {
    path: PathBuf,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    status_col: Option<usize>,
}

impl CsvTable {
    /// Read the whole input file. Strips a UTF-8 BOM, suffixes duplicate
    /// headers with ` (2)`, ` (3)`, ..., pads ragged rows with empty cells.
    /// Rows wider than the header are a hard error (malformed file).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .wrap_err_with(|| format!("failed to open input csv {}", path.display()))?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut headers: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<String>> = Vec::new();

        for (idx, record) in reader.records().enumerate() {
            let record = record
                .wrap_err_with(|| format!("malformed csv record {} in {}", idx + 1, path.display()))?;
            let mut cells: Vec<String> = record.iter().map(|c| c.to_string()).collect();

            if idx == 0 {
                if let Some(first) = cells.first_mut() {
                    *first = first.trim_start_matches('\u{feff}').to_string();
                }
                headers = dedupe_headers(cells);
                continue;
            }

            if headers.is_empty() {
                return Err(eyre!("input csv {} has no header row", path.display()));
            }
            if cells.len() > headers.len() {
                return Err(eyre!(
                    "row {} has {} cells but the header has {} columns",
                    idx,
                    cells.len(),
                    headers.len()
                ));
            }
            cells.resize(headers.len(), String::new());
            rows.push(cells);
        }

        if headers.is_empty() {
            return Err(eyre!("input csv {} is empty (headers required)", path.display()));
        }

        let status_col = find_status_column(&headers);
        Ok(Self {
            path: path.to_path_buf(),
            headers,
            rows,
            status_col,
        })
    }

    /// Add the `Status` column if the header lacks it and rewrite the file
    /// once, before any work begins. Returns whether a rewrite happened.
    pub fn ensure_status_column(&mut self) -> Result<bool> {
        if self.status_col.is_some() {
            return Ok(false);
        }
        self.headers.push(STATUS_COLUMN.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.status_col = Some(self.headers.len() - 1);
        self.rewrite()?;
        Ok(true)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether the row is already closed ("done", trimmed, case-insensitive).
    pub fn is_done(&self, row_index: usize) -> bool {
        let Some(col) = self.status_col else {
            return false;
        };
        self.rows
            .get(row_index)
            .and_then(|r| r.get(col))
            .map(|c| c.trim().eq_ignore_ascii_case(STATUS_DONE))
            .unwrap_or(false)
    }

    fn set_status_done(&mut self, row_index: usize) -> Result<()> {
        let col = self
            .status_col
            .ok_or_else(|| eyre!("status column missing (ensure_status_column not called)"))?;
        let row = self
            .rows
            .get_mut(row_index)
            .ok_or_else(|| eyre!("row index {row_index} out of range"))?;
        row[col] = STATUS_DONE.to_string();
        Ok(())
    }

    /// Serialize all cells back (no column dropped, no reordering) and
    /// replace the file atomically.
    pub fn rewrite(&self) -> Result<()> {
        let bytes = encode_rows(&self.headers, &self.rows)?;
        write_atomic(&self.path, &bytes)
    }
}

fn find_status_column(headers: &[String]) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(STATUS_COLUMN))
}

fn dedupe_headers(headers: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(headers.len());
    for name in headers {
        if !out.iter().any(|h| h == &name) {
            out.push(name);
            continue;
        }
        let mut n = 2usize;
        loop {
            let candidate = format!("{name} ({n})");
            if !out.iter().any(|h| h == &candidate) {
                out.push(candidate);
                break;
            }
            n += 1;
        }
    }
    out
}

fn encode_rows(headers: &[String], rows: &[Vec<String>]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| eyre!("failed to flush csv buffer: {e}"))
}

/// Atomic replace: write a sibling temp file, fsync, rename over the
/// original. A failed write is retried once before surfacing.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    match try_write_atomic(path, bytes) {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "write failed; retrying once");
            std::thread::sleep(Duration::from_millis(50));
            try_write_atomic(path, bytes)
        }
    }
}

fn try_write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let ext = match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    };
    let tmp_path = path.with_extension(ext);

    let mut tmp = File::create(&tmp_path)
        .wrap_err_with(|| format!("failed to create temp file {}", tmp_path.display()))?;
    tmp.write_all(bytes)
        .wrap_err_with(|| format!("failed to write temp file {}", tmp_path.display()))?;
    tmp.sync_all()
        .wrap_err_with(|| format!("failed to fsync temp file {}", tmp_path.display()))?;
    drop(tmp);

    // On Unix, rename replaces the destination if it exists.
    // On Windows, rename fails if the destination exists; remove then rename.
    if let Err(err) = fs::rename(&tmp_path, path) {
        if cfg!(windows) {
            let _ = fs::remove_file(path);
            fs::rename(&tmp_path, path)
                .wrap_err_with(|| format!("failed to replace {}", path.display()))?;
        } else {
            return Err(eyre!("failed to replace {}: {err}", path.display()));
        }
    }
    Ok(())
}

/// Defeat spreadsheet formula injection: a cell whose first character is one
/// of `+ - = @` is rewritten as a quoted string-literal formula.
pub fn guard_cell(cell: &str) -> String {
    match cell.chars().next() {
        Some('+' | '-' | '=' | '@') => format!("=\"{cell}\""),
        _ => cell.to_string(),
    }
}

/// Reverse of [`guard_cell`], for readers that want the original value back.
pub fn unguard_cell(cell: &str) -> &str {
    cell.strip_prefix("=\"")
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(cell)
}

/// Borrowed view of one input row with case-insensitive column lookup.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    headers: &'a [String],
    cells: &'a [String],
}

impl<'a> RowView<'a> {
    pub fn new(headers: &'a [String], cells: &'a [String]) -> Self {
        Self { headers, cells }
    }

    /// The cell under `column`, or `""` when the column is absent.
    pub fn get(&self, column: &str) -> &'a str {
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(column.trim()))
            .and_then(|i| self.cells.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Commands accepted by the serialized writer task.
#[derive(Debug)]
enum StoreCmd {
    MarkDone { row_index: usize },
    Append { rows: Vec<Vec<String>> },
}

/// Cheap cloneable handle workers use to enqueue writes. All file mutation
/// happens on the single writer task, so checkpoints are linearizable and the
/// input file is never torn.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<StoreCmd>,
}

impl StoreWriter {
    /// Set `Status=done` for the row and rewrite the input atomically.
    pub fn mark_done(&self, row_index: usize) {
        // A closed channel means the writer task died; its error surfaces
        // through the join handle.
        let _ = self.tx.send(StoreCmd::MarkDone { row_index });
    }

    /// Append output rows in completion order, flushed per message.
    pub fn append(&self, rows: Vec<Vec<String>>) {
        let _ = self.tx.send(StoreCmd::Append { rows });
    }
}

/// Spawn the writer task. It owns the table and the lazily-opened output
/// file; it drains its queue and exits when every `StoreWriter` is dropped.
/// On an unrecoverable write error it cancels the run and returns the error.
pub fn spawn_writer(
    table: CsvTable,
    output_path: PathBuf,
    output_columns: Vec<String>,
    cancel: CancellationToken,
) -> (StoreWriter, JoinHandle<Result<()>>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut table = table;
        let mut out: Option<csv::Writer<File>> = None;
        while let Some(cmd) = rx.recv().await {
            if let Err(err) = apply_cmd(&mut table, &mut out, &output_path, &output_columns, cmd) {
                cancel.cancel();
                return Err(err);
            }
        }
        if let Some(mut writer) = out {
            writer.flush().wrap_err("failed to flush output csv")?;
        }
        Ok(())
    });
    (StoreWriter { tx }, handle)
}

fn apply_cmd(
    table: &mut CsvTable,
    out: &mut Option<csv::Writer<File>>,
    output_path: &Path,
    output_columns: &[String],
    cmd: StoreCmd,
) -> Result<()> {
    match cmd {
        StoreCmd::MarkDone { row_index } => {
            table.set_status_done(row_index)?;
            table.rewrite()
        }
        StoreCmd::Append { rows } => {
            let writer = ensure_output(out, output_path, output_columns)?;
            for row in rows {
                let guarded: Vec<String> = row.iter().map(|c| guard_cell(c)).collect();
                writer.write_record(&guarded)?;
            }
            writer.flush().wrap_err("failed to flush output csv")?;
            Ok(())
        }
    }
}

fn ensure_output<'a>(
    out: &'a mut Option<csv::Writer<File>>,
    path: &Path,
    columns: &[String],
) -> Result<&'a mut csv::Writer<File>> {
    if let Some(writer) = out {
        return Ok(writer);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create output directory {}", parent.display()))?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .wrap_err_with(|| format!("failed to open output csv {}", path.display()))?;
    // Resumed runs append to an existing file; only a fresh file gets the header.
    let write_header = file
        .metadata()
        .map(|m| m.len() == 0)
        .unwrap_or(true);
    let mut writer = csv::WriterBuilder::new().from_writer(file);
    if write_header {
        writer.write_record(columns)?;
        writer.flush().wrap_err("failed to flush output header")?;
    }
    Ok(out.insert(writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn load_strips_bom_and_dedupes_headers() {
        let f = write_temp("\u{feff}Email,Name,Name\na@x.com,Al,Alo\n");
        let table = CsvTable::load(f.path()).unwrap();
        assert_eq!(table.headers(), &["Email", "Name", "Name (2)"]);
        assert_eq!(table.rows()[0], vec!["a@x.com", "Al", "Alo"]);
    }

    #[test]
    fn load_pads_ragged_rows_and_rejects_long_ones() {
        let f = write_temp("A,B,C\n1,2\n");
        let table = CsvTable::load(f.path()).unwrap();
        assert_eq!(table.rows()[0], vec!["1", "2", ""]);

        let f = write_temp("A,B\n1,2,3\n");
        let err = CsvTable::load(f.path()).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn load_handles_quoted_newlines() {
        let f = write_temp("A,B\n\"line1\nline2\",x\n");
        let table = CsvTable::load(f.path()).unwrap();
        assert_eq!(table.rows()[0][0], "line1\nline2");
    }

    #[test]
    fn ensure_status_adds_column_and_rewrites_once() {
        let f = write_temp("Email\na@x.com\nb@x.com\n");
        let mut table = CsvTable::load(f.path()).unwrap();
        assert!(table.ensure_status_column().unwrap());

        let reloaded = CsvTable::load(f.path()).unwrap();
        assert_eq!(reloaded.headers(), &["Email", "Status"]);
        assert!(!reloaded.is_done(0));

        // Already present (any case): no rewrite.
        let f2 = write_temp("Email,status\na@x.com,DONE\n");
        let mut table2 = CsvTable::load(f2.path()).unwrap();
        assert!(!table2.ensure_status_column().unwrap());
        assert!(table2.is_done(0));
    }

    #[test]
    fn checkpoint_rewrite_roundtrips_unchanged_rows() {
        let original = "Email,Status\na@x.com,\nb@x.com,done\n";
        let f = write_temp(original);
        let table = CsvTable::load(f.path()).unwrap();
        table.rewrite().unwrap();
        let after = std::fs::read_to_string(f.path()).unwrap();
        assert_eq!(after, original);
    }

    #[test]
    fn guard_cell_defeats_formula_prefixes() {
        for prefix in ["+1 555", "-2", "=SUM(A1)", "@cmd"] {
            let guarded = guard_cell(prefix);
            assert!(guarded.starts_with("=\""), "{guarded}");
            assert_eq!(unguard_cell(&guarded), prefix);
        }
        assert_eq!(guard_cell("plain"), "plain");
        assert_eq!(unguard_cell("plain"), "plain");
    }

    #[test]
    fn row_view_lookup_is_case_insensitive() {
        let headers = vec!["Post URL".to_string(), "Status".to_string()];
        let cells = vec!["https://x".to_string(), "".to_string()];
        let row = RowView::new(&headers, &cells);
        assert_eq!(row.get("post url"), "https://x");
        assert_eq!(row.get("Missing"), "");
    }

    #[tokio::test]
    async fn writer_task_checkpoints_and_appends() {
        let f = write_temp("Email,Status\na@x.com,\nb@x.com,\n");
        let out_dir = tempfile::tempdir().unwrap();
        let out_path = out_dir.path().join("out.csv");

        let mut table = CsvTable::load(f.path()).unwrap();
        table.ensure_status_column().unwrap();

        let cancel = CancellationToken::new();
        let (writer, handle) = spawn_writer(
            table,
            out_path.clone(),
            vec!["Email".into(), "Found".into()],
            cancel,
        );

        writer.append(vec![vec!["a@x.com".into(), "=HYPERLINK(1)".into()]]);
        writer.mark_done(0);
        drop(writer);
        handle.await.unwrap().unwrap();

        let input_after = std::fs::read_to_string(f.path()).unwrap();
        assert!(input_after.contains("a@x.com,done"));
        assert!(input_after.contains("b@x.com,"));

        let output_after = std::fs::read_to_string(&out_path).unwrap();
        let mut lines = output_after.lines();
        assert_eq!(lines.next().unwrap(), "Email,Found");
        // Formula-guarded and csv-quoted.
        let data = lines.next().unwrap();
        assert!(data.starts_with("a@x.com,"));
        assert_eq!(unguard_cell("=\"=HYPERLINK(1)\""), "=HYPERLINK(1)");
    }

    #[tokio::test]
    async fn writer_reopens_existing_output_without_duplicate_header() {
        let f = write_temp("Email,Status\na@x.com,\n");
        let out_dir = tempfile::tempdir().unwrap();
        let out_path = out_dir.path().join("out.csv");
        std::fs::write(&out_path, "Email,Found\nold@x.com,1\n").unwrap();

        let table = CsvTable::load(f.path()).unwrap();
        let cancel = CancellationToken::new();
        let (writer, handle) = spawn_writer(
            table,
            out_path.clone(),
            vec!["Email".into(), "Found".into()],
            cancel,
        );
        writer.append(vec![vec!["a@x.com".into(), "2".into()]]);
        drop(writer);
        handle.await.unwrap().unwrap();

        let output_after = std::fs::read_to_string(&out_path).unwrap();
        assert_eq!(output_after, "Email,Found\nold@x.com,1\na@x.com,2\n");
    }
}
