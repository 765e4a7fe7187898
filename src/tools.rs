use crate::config::ColumnMap;
use crate::store::RowView;
use serde_json::{json, Value};

/// A mapped work item: the dedup/cache key plus the driver payload.
#[derive(Debug, Clone)]
pub struct BuiltRequest {
    pub key: String,
    pub request: Value,
}

/// Outcome of the pure row-to-request mapper.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Built(BuiltRequest),
    /// The row cannot produce a request (missing/empty key field); it is
    /// closed as a failure without a driver call.
    Skip(String),
}

/// Output rows derived from one driver response. `matched` distinguishes a
/// real hit from a valid "not found" answer.
#[derive(Debug, Clone, Default)]
pub struct BuiltOutput {
    pub rows: Vec<Vec<String>>,
    pub matched: bool,
}

type BuildRequestFn = fn(RowView<'_>, &ColumnMap, u32) -> RequestOutcome;
type BuildOutputFn = fn(RowView<'_>, &ColumnMap, &Value) -> BuiltOutput;

/// One registry entry: endpoint, output shape, and the two pure mappers.
pub struct ToolSpec {
    pub id: &'static str,
    pub label: &'static str,
    pub endpoint: &'static str,
    /// Fixed output column set; the last two are always `error_status` and
    /// `error_message`.
    pub output_columns: &'static [&'static str],
    /// Whether the driver consumes roughly one credit per returned item
    /// (batched list tools) rather than one per request.
    pub batched: bool,
    pub build_request: BuildRequestFn,
    pub build_output_rows: BuildOutputFn,
}

impl ToolSpec {
    /// Credits to reserve before a call.
    pub fn estimated_cost(&self, batch_size: u32) -> u32 {
        if self.batched {
            batch_size.max(1)
        } else {
            1
        }
    }

    pub fn output_columns_vec(&self) -> Vec<String> {
        self.output_columns.iter().map(|c| c.to_string()).collect()
    }

    /// A failure row: data columns empty, the trailing error pair filled.
    pub fn failure_row(&self, error_status: &str, error_message: &str) -> Vec<String> {
        let mut row = vec![String::new(); self.output_columns.len()];
        let n = row.len();
        if n >= 2 {
            row[n - 2] = error_status.to_string();
            row[n - 1] = error_message.to_string();
        }
        row
    }
}

pub static TOOLS: &[ToolSpec] = &[
    ToolSpec {
        id: "post-reactions",
        label: "LinkedIn Post Reactions Scraper",
        endpoint: "acts/post-reactions/run-sync",
        output_columns: &[
            "Post URL",
            "Reactor Name",
            "Reactor Headline",
            "Reactor Profile URL",
            "Reaction Type",
            "error_status",
            "error_message",
        ],
        batched: true,
        build_request: reactions_request,
        build_output_rows: reactions_output,
    },
    ToolSpec {
        id: "post-comments",
        label: "LinkedIn Post Comments Scraper",
        endpoint: "acts/post-comments/run-sync",
        output_columns: &[
            "Post URL",
            "Commenter Name",
            "Commenter Headline",
            "Commenter Profile URL",
            "Comment Text",
            "error_status",
            "error_message",
        ],
        batched: true,
        build_request: comments_request,
        build_output_rows: comments_output,
    },
    ToolSpec {
        id: "email-enricher",
        label: "Profile Email Enricher",
        endpoint: "acts/email-enricher/run-sync",
        output_columns: &[
            "LinkedIn URL",
            "Full Name",
            "Email",
            "Email Status",
            "error_status",
            "error_message",
        ],
        batched: false,
        build_request: email_request,
        build_output_rows: email_output,
    },
    ToolSpec {
        id: "employee-finder",
        label: "Company Employee Finder",
        endpoint: "acts/employee-finder/run-sync",
        output_columns: &[
            "Company Domain",
            "Employee Name",
            "Employee Title",
            "Employee Profile URL",
            "error_status",
            "error_message",
        ],
        batched: true,
        build_request: employees_request,
        build_output_rows: employees_output,
    },
];

pub fn lookup(tool_id: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|t| t.id == tool_id)
}

/// Trimmed, lowercased natural identifier used for caching and dedup.
fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn text(value: &Value, field: &str) -> String {
    match value.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn url_request(
    row: RowView<'_>,
    map: &ColumnMap,
    batch_size: u32,
    logical: &str,
    default_column: &str,
) -> RequestOutcome {
    let column = map.column(logical, default_column);
    let url = row.get(column).trim();
    if url.is_empty() {
        return RequestOutcome::Skip(format!("missing value in column \"{column}\""));
    }
    RequestOutcome::Built(BuiltRequest {
        key: normalize_key(url),
        request: json!({ "postUrl": url, "maxItems": batch_size }),
    })
}

fn reactions_request(row: RowView<'_>, map: &ColumnMap, batch_size: u32) -> RequestOutcome {
    url_request(row, map, batch_size, "postUrl", "Post URL")
}

fn reactions_output(row: RowView<'_>, map: &ColumnMap, parsed: &Value) -> BuiltOutput {
    let url = row.get(map.column("postUrl", "Post URL")).trim();
    let rows: Vec<Vec<String>> = parsed
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    vec![
                        url.to_string(),
                        text(item, "name"),
                        text(item, "headline"),
                        text(item, "profileUrl"),
                        text(item, "reactionType"),
                        String::new(),
                        String::new(),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();
    BuiltOutput {
        matched: !rows.is_empty(),
        rows,
    }
}

fn comments_request(row: RowView<'_>, map: &ColumnMap, batch_size: u32) -> RequestOutcome {
    url_request(row, map, batch_size, "postUrl", "Post URL")
}

fn comments_output(row: RowView<'_>, map: &ColumnMap, parsed: &Value) -> BuiltOutput {
    let url = row.get(map.column("postUrl", "Post URL")).trim();
    let rows: Vec<Vec<String>> = parsed
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    vec![
                        url.to_string(),
                        text(item, "name"),
                        text(item, "headline"),
                        text(item, "profileUrl"),
                        text(item, "text"),
                        String::new(),
                        String::new(),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();
    BuiltOutput {
        matched: !rows.is_empty(),
        rows,
    }
}

fn email_request(row: RowView<'_>, map: &ColumnMap, _batch_size: u32) -> RequestOutcome {
    let column = map.column("profileUrl", "LinkedIn URL");
    let url = row.get(column).trim();
    if url.is_empty() {
        return RequestOutcome::Skip(format!("missing value in column \"{column}\""));
    }
    RequestOutcome::Built(BuiltRequest {
        key: normalize_key(url),
        request: json!({ "profileUrl": url }),
    })
}

fn email_output(row: RowView<'_>, map: &ColumnMap, parsed: &Value) -> BuiltOutput {
    let url = row.get(map.column("profileUrl", "LinkedIn URL")).trim();
    let email = text(parsed, "email");
    let matched = !email.is_empty();
    BuiltOutput {
        rows: vec![vec![
            url.to_string(),
            text(parsed, "fullName"),
            email,
            text(parsed, "emailStatus"),
            String::new(),
            String::new(),
        ]],
        matched,
    }
}

fn employees_request(row: RowView<'_>, map: &ColumnMap, batch_size: u32) -> RequestOutcome {
    let column = map.column("domain", "Company Domain");
    let domain = row.get(column).trim();
    if domain.is_empty() {
        return RequestOutcome::Skip(format!("missing value in column \"{column}\""));
    }
    RequestOutcome::Built(BuiltRequest {
        key: normalize_key(domain),
        request: json!({ "domain": domain, "maxItems": batch_size }),
    })
}

fn employees_output(row: RowView<'_>, map: &ColumnMap, parsed: &Value) -> BuiltOutput {
    let domain = row.get(map.column("domain", "Company Domain")).trim();
    let rows: Vec<Vec<String>> = parsed
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    vec![
                        domain.to_string(),
                        text(item, "name"),
                        text(item, "title"),
                        text(item, "profileUrl"),
                        String::new(),
                        String::new(),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();
    BuiltOutput {
        matched: !rows.is_empty(),
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map() -> ColumnMap {
        ColumnMap::default()
    }

    #[test]
    fn registry_resolves_known_ids() {
        assert!(lookup("post-reactions").is_some());
        assert!(lookup("email-enricher").is_some());
        assert!(lookup("nope").is_none());
    }

    #[test]
    fn every_tool_ends_with_the_error_columns() {
        for tool in TOOLS {
            let cols = tool.output_columns;
            assert_eq!(cols[cols.len() - 2], "error_status", "{}", tool.id);
            assert_eq!(cols[cols.len() - 1], "error_message", "{}", tool.id);
        }
    }

    #[test]
    fn batched_tools_scale_estimate_with_batch_size() {
        let reactions = lookup("post-reactions").unwrap();
        assert_eq!(reactions.estimated_cost(50), 50);
        let email = lookup("email-enricher").unwrap();
        assert_eq!(email.estimated_cost(50), 1);
    }

    #[test]
    fn request_mapper_skips_empty_key_and_normalizes() {
        let tool = lookup("post-reactions").unwrap();
        let headers = vec!["Post URL".to_string()];

        let cells = vec!["  https://LinkedIn.com/posts/X  ".to_string()];
        let row = RowView::new(&headers, &cells);
        match (tool.build_request)(row, &map(), 25) {
            RequestOutcome::Built(built) => {
                assert_eq!(built.key, "https://linkedin.com/posts/x");
                assert_eq!(built.request["maxItems"], 25);
                assert_eq!(built.request["postUrl"], "https://LinkedIn.com/posts/X");
            }
            RequestOutcome::Skip(reason) => panic!("unexpected skip: {reason}"),
        }

        let empty = vec!["   ".to_string()];
        let row = RowView::new(&headers, &empty);
        assert!(matches!(
            (tool.build_request)(row, &map(), 25),
            RequestOutcome::Skip(_)
        ));
    }

    #[test]
    fn column_map_redirects_the_key_field() {
        let tool = lookup("email-enricher").unwrap();
        let map = ColumnMap::new(
            [("profileUrl".to_string(), "Member URL".to_string())]
                .into_iter()
                .collect(),
        );
        let headers = vec!["Member URL".to_string()];
        let cells = vec!["https://linkedin.com/in/ada".to_string()];
        let row = RowView::new(&headers, &cells);
        assert!(matches!(
            (tool.build_request)(row, &map, 1),
            RequestOutcome::Built(_)
        ));
    }

    #[test]
    fn list_output_fans_out_one_row_per_item() {
        let tool = lookup("employee-finder").unwrap();
        let headers = vec!["Company Domain".to_string()];
        let cells = vec!["acme.io".to_string()];
        let row = RowView::new(&headers, &cells);
        let parsed = json!({"items": [
            {"name": "Ada", "title": "CTO", "profileUrl": "https://l/in/ada"},
            {"name": "Grace", "title": "VP Eng", "profileUrl": "https://l/in/grace"},
        ]});
        let out = (tool.build_output_rows)(row, &map(), &parsed);
        assert!(out.matched);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0][0], "acme.io");
        assert_eq!(out.rows[1][1], "Grace");
    }

    #[test]
    fn empty_result_is_a_no_match() {
        let tool = lookup("email-enricher").unwrap();
        let headers = vec!["LinkedIn URL".to_string()];
        let cells = vec!["https://l/in/ada".to_string()];
        let row = RowView::new(&headers, &cells);
        let out = (tool.build_output_rows)(row, &map(), &json!({"email": "", "fullName": "Ada"}));
        assert!(!out.matched);
        assert_eq!(out.rows.len(), 1);

        let tool = lookup("post-reactions").unwrap();
        let headers = vec!["Post URL".to_string()];
        let cells = vec!["https://l/posts/1".to_string()];
        let row = RowView::new(&headers, &cells);
        let out = (tool.build_output_rows)(row, &map(), &json!({"items": []}));
        assert!(!out.matched);
        assert!(out.rows.is_empty());
    }

    #[test]
    fn failure_row_fills_only_the_error_pair() {
        let tool = lookup("post-reactions").unwrap();
        let row = tool.failure_row("no_credits", "no credits remaining");
        assert_eq!(row.len(), tool.output_columns.len());
        assert!(row[..row.len() - 2].iter().all(String::is_empty));
        assert_eq!(row[row.len() - 2], "no_credits");
        assert_eq!(row[row.len() - 1], "no credits remaining");
    }
}
