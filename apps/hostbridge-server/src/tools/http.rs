//! HTTP egress tool. Every request passes the egress guard (scheme, SSRF,
//! domain lists) before any connection is opened; timeouts are clamped to
//! the configured ceiling and responses truncated to the configured size.

use crate::egress;
use crate::error::ToolError;
use crate::registry::{HandlerResult, ToolContext, ToolDescriptor};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|e| ToolError::invalid(e.to_string()))
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RequestRequest {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: Option<HashMap<String, String>>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    json_body: Option<Value>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default = "default_true")]
    follow_redirects: bool,
}

async fn request(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: RequestRequest = parse(params)?;
    let method = egress::check_method(&req.method)?;
    let url = egress::check_url(&req.url, &ctx.http)?;
    if req.body.is_some() && req.json_body.is_some() {
        return Err(ToolError::invalid(
            "Provide either 'body' or 'json_body', not both.",
        ));
    }
    let timeout = req
        .timeout
        .unwrap_or(ctx.http.default_timeout)
        .min(ctx.http.max_timeout)
        .max(1);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout))
        .redirect(if req.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        })
        .build()
        .map_err(|e| ToolError::internal(format!("failed to build http client: {e}")))?;

    let parsed_method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| ToolError::invalid(format!("Invalid HTTP method '{method}'")))?;
    let mut builder = client.request(parsed_method, url.clone());
    if let Some(headers) = &req.headers {
        for (k, v) in headers {
            builder = builder.header(k, v);
        }
    }
    if let Some(json_body) = &req.json_body {
        builder = builder.json(json_body);
    } else if let Some(body) = &req.body {
        builder = builder.body(body.clone());
    }

    info!(method = %method, url = %url, timeout, "http egress request");
    let started = Instant::now();
    let response = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(ToolError::internal("Request cancelled")),
        resp = builder.send() => resp.map_err(|e| {
            if e.is_timeout() {
                ToolError::timeout(format!("HTTP request timed out after {timeout}s"))
            } else if e.is_connect() {
                ToolError::internal(format!("HTTP connection failed: {e}"))
            } else {
                ToolError::internal(format!("HTTP request failed: {e}"))
            }
        })?,
    };

    let status_code = response.status().as_u16();
    let final_url = response.url().to_string();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let resp_headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
        .collect();

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ToolError::internal(format!("Failed to read response body: {e}")))?;
    let duration_ms = started.elapsed().as_millis() as i64;

    let max_bytes = ctx.http.max_response_size_kb * 1024;
    let text = String::from_utf8_lossy(&bytes);
    let body = if bytes.len() > max_bytes {
        let mut end = max_bytes.min(text.len());
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        format!(
            "{}\n\n[TRUNCATED: response exceeded {} KB limit]",
            &text[..end],
            ctx.http.max_response_size_kb
        )
    } else {
        text.into_owned()
    };

    Ok(json!({
        "status_code": status_code,
        "headers": resp_headers,
        "body": body,
        "url": final_url,
        "duration_ms": duration_ms,
        "content_type": content_type,
    }))
}

pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![ToolDescriptor::new(
        "http",
        "request",
        "Make an outbound HTTP request. Private/reserved addresses and cloud metadata \
         endpoints are blocked when SSRF protection is enabled; domain allow/deny \
         lists apply; responses are truncated to the configured size.",
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string"},
                "method": {"type": "string", "default": "GET"},
                "headers": {"type": ["object", "null"], "additionalProperties": {"type": "string"}},
                "body": {"type": ["string", "null"]},
                "json_body": {},
                "timeout": {"type": ["integer", "null"], "minimum": 1},
                "follow_redirects": {"type": "boolean", "default": true},
            },
            "required": ["url"],
        }),
        false,
        Some("url"),
        Arc::new(|ctx, params| Box::pin(request(ctx, params))),
    )]
}
