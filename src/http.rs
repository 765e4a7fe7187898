use crate::driver::{ActorDriver, CallKind, CallOutcome};
use eyre::Result;
use serde_json::Value;

/// Driver that posts one JSON request per work item to the actor API and
/// classifies the response. Retry policy lives in
/// [`crate::driver::call_with_retry`]; this type performs exactly one
/// attempt per call and never writes to stdout.
#[derive(Debug, Clone)]
pub struct HttpActorDriver {
    http: reqwest::Client,
    url: String,
}

impl HttpActorDriver {
    pub fn new(base_url: &str, endpoint: &str) -> Self {
        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        );
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }
}

impl ActorDriver for HttpActorDriver {
    async fn call_once(&self, token: &str, request: &Value) -> Result<CallOutcome> {
        let response = match self
            .http
            .post(&self.url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await
        {
            Ok(response) => response,
            // Connect/DNS/TLS failures are retryable, not errors.
            Err(err) => {
                return Ok(CallOutcome {
                    kind: CallKind::Transient,
                    http_status: 0,
                    cost_actual: 0,
                    parsed: Value::Null,
                    message: Some(format!("request failed: {err}")),
                })
            }
        };

        let http_status = response.status().as_u16();
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                return Ok(CallOutcome {
                    kind: CallKind::Transient,
                    http_status,
                    cost_actual: 0,
                    parsed: Value::Null,
                    message: Some(format!("failed to read response body: {err}")),
                })
            }
        };
        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        let message = if !(200..300).contains(&http_status) || parsed.get("error").is_some() {
            error_message(&parsed, &text)
        } else {
            None
        };
        let kind = classify(http_status, message.as_deref());
        let cost_actual = extract_cost(&parsed, kind);

        Ok(CallOutcome {
            kind,
            http_status,
            cost_actual,
            parsed,
            message,
        })
    }
}

/// Map an HTTP status plus an optional parsed error message onto a call
/// classification. Unambiguous statuses win; 4xx and 200-with-error bodies
/// are refined by message sniffing.
pub fn classify(http_status: u16, message: Option<&str>) -> CallKind {
    match http_status {
        401 | 403 => CallKind::AuthInvalid,
        402 => CallKind::Billing,
        429 => CallKind::Transient,
        s if s >= 500 => CallKind::Transient,
        s if (200..300).contains(&s) => match message {
            None => CallKind::Success,
            Some(m) => sniff(m).unwrap_or(CallKind::ClientError),
        },
        _ => message.and_then(sniff).unwrap_or(CallKind::ClientError),
    }
}

fn sniff(message: &str) -> Option<CallKind> {
    let m = message.to_ascii_lowercase();
    if m.contains("quota") {
        return Some(CallKind::QuotaExhausted);
    }
    if m.contains("billing") || m.contains("insufficient funds") || m.contains("payment required") {
        return Some(CallKind::Billing);
    }
    if m.contains("invalid token")
        || m.contains("token expired")
        || m.contains("expired token")
        || m.contains("unauthorized")
    {
        return Some(CallKind::AuthInvalid);
    }
    if m.contains("rate limit") {
        return Some(CallKind::Transient);
    }
    None
}

fn error_message(parsed: &Value, raw: &str) -> Option<String> {
    let from_body = parsed
        .get("error")
        .and_then(|e| {
            e.as_str()
                .map(str::to_string)
                .or_else(|| e.get("message").and_then(Value::as_str).map(str::to_string))
        })
        .or_else(|| parsed.get("message").and_then(Value::as_str).map(str::to_string));
    from_body.or_else(|| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.chars().take(240).collect())
        }
    })
}

/// Credits the remote actually consumed. Prefer the explicit counter;
/// otherwise, for successes, fall back to the number of items returned.
/// Successful calls always cost at least one credit.
fn extract_cost(parsed: &Value, kind: CallKind) -> u32 {
    let reported = parsed
        .get("creditsUsed")
        .and_then(Value::as_u64)
        .map(|v| v.min(u64::from(u32::MAX)) as u32);
    if let Some(cost) = reported {
        return cost;
    }
    if kind == CallKind::Success {
        let items = parsed
            .get("items")
            .and_then(Value::as_array)
            .map(|a| a.len() as u32)
            .unwrap_or(0);
        return items.max(1);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn statuses_map_to_kinds() {
        assert_eq!(classify(200, None), CallKind::Success);
        assert_eq!(classify(401, None), CallKind::AuthInvalid);
        assert_eq!(classify(403, None), CallKind::AuthInvalid);
        assert_eq!(classify(402, None), CallKind::Billing);
        assert_eq!(classify(429, None), CallKind::Transient);
        assert_eq!(classify(503, None), CallKind::Transient);
        assert_eq!(classify(400, None), CallKind::ClientError);
        assert_eq!(classify(404, None), CallKind::ClientError);
    }

    #[test]
    fn body_sniffing_refines_ambiguous_statuses() {
        assert_eq!(
            classify(400, Some("monthly quota exceeded")),
            CallKind::QuotaExhausted
        );
        assert_eq!(
            classify(400, Some("billing problem on account")),
            CallKind::Billing
        );
        assert_eq!(
            classify(200, Some("invalid token supplied")),
            CallKind::AuthInvalid
        );
        assert_eq!(classify(400, Some("rate limit hit")), CallKind::Transient);
        assert_eq!(classify(400, Some("bad postUrl")), CallKind::ClientError);
    }

    #[test]
    fn cost_prefers_reported_then_items() {
        assert_eq!(
            extract_cost(&json!({"creditsUsed": 7, "items": [1, 2]}), CallKind::Success),
            7
        );
        assert_eq!(
            extract_cost(&json!({"items": [1, 2, 3]}), CallKind::Success),
            3
        );
        // Success never costs less than one credit.
        assert_eq!(extract_cost(&json!({"items": []}), CallKind::Success), 1);
        assert_eq!(extract_cost(&json!({}), CallKind::ClientError), 0);
        // A client error with reported consumption still carries the cost.
        assert_eq!(
            extract_cost(&json!({"creditsUsed": 1}), CallKind::ClientError),
            1
        );
    }

    #[test]
    fn error_message_prefers_structured_fields() {
        assert_eq!(
            error_message(&json!({"error": {"message": "boom"}}), "ignored"),
            Some("boom".to_string())
        );
        assert_eq!(
            error_message(&json!({"error": "flat"}), "ignored"),
            Some("flat".to_string())
        );
        assert_eq!(
            error_message(&Value::Null, "  raw body  "),
            Some("raw body".to_string())
        );
        assert_eq!(error_message(&Value::Null, "   "), None);
    }
}
