//! HTTP node executor. Grounded on the teacher's
//! `integration-service::retry::RetryPolicy`, but spec.md §4.B calls for
//! linear 1-, 2-, 3-second retry spacing rather than the teacher's
//! exponential backoff — kept linear here, noted in DESIGN.md.

use crate::expression;
use crate::nodes::NodeOutcome;
use common::types::{ExecutionContext, JsonValue};
use std::collections::HashMap;
use std::time::Duration;

pub async fn execute(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    headers: &HashMap<String, String>,
    body: &Option<JsonValue>,
    timeout_secs: Option<u64>,
    success_codes: &[u16],
    retry_on_failure: bool,
    max_retries: u32,
    snapshot: &JsonValue,
) -> NodeOutcome {
    let ctx = ExecutionContext::from_json(snapshot.clone());

    let resolved_url = match expression::evaluate_string(url, &ctx) {
        Ok(JsonValue::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(e) => return NodeOutcome::fail(format!("url resolution failed: {e}"), JsonValue::Null),
    };

    let mut resolved_headers = HashMap::with_capacity(headers.len());
    for (k, v) in headers {
        match expression::evaluate_string(v, &ctx) {
            Ok(JsonValue::String(s)) => {
                resolved_headers.insert(k.clone(), s);
            }
            Ok(other) => {
                resolved_headers.insert(k.clone(), other.to_string());
            }
            Err(e) => return NodeOutcome::fail(format!("header `{k}` resolution failed: {e}"), JsonValue::Null),
        }
    }

    let resolved_body = match body {
        Some(b) => match expression::resolve_value(b, &ctx) {
            Ok(v) => Some(v),
            Err(e) => return NodeOutcome::fail(format!("body resolution failed: {e}"), JsonValue::Null),
        },
        None => None,
    };

    let timeout = Duration::from_secs(timeout_secs.unwrap_or(30));
    let max_attempts = if retry_on_failure { max_retries + 1 } else { 1 };

    let mut attempt = 0;
    let mut last_error = String::new();
    loop {
        attempt += 1;
        match perform_once(client, &resolved_url, method, &resolved_headers, &resolved_body, timeout).await {
            Ok((status, parsed)) => {
                let success = success_codes.contains(&status);
                let output = serde_json::json!({
                    "status": status,
                    "body_parsed": parsed,
                });
                if success {
                    return NodeOutcome::ok(output);
                }
                last_error = format!("status {status} not in success_codes {success_codes:?}");
                if attempt >= max_attempts {
                    return NodeOutcome::fail(last_error, output);
                }
            }
            Err(e) => {
                last_error = e;
                if attempt >= max_attempts {
                    return NodeOutcome::fail(last_error, JsonValue::Null);
                }
            }
        }
        // Linear 1-, 2-, 3-…second retry spacing per spec.md §4.B.
        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
    }
}

async fn perform_once(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    headers: &HashMap<String, String>,
    body: &Option<JsonValue>,
    timeout: Duration,
) -> Result<(u16, JsonValue), String> {
    let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| format!("invalid HTTP method `{method}`"))?;
    let mut builder = client.request(method, url).timeout(timeout);
    for (k, v) in headers {
        builder = builder.header(k, v);
    }
    if let Some(b) = body {
        builder = builder.json(b);
    }
    let response = builder.send().await.map_err(|e| format!("transport error: {e}"))?;
    let status = response.status().as_u16();
    let parsed = response
        .json::<JsonValue>()
        .await
        .unwrap_or(JsonValue::Null);
    Ok((status, parsed))
}
