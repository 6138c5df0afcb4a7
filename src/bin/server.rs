//! HTTP server for the analytics gateway
//! Simple HTTP/1.1 handling on tokio; one request per connection.

use analytics_gateway::pipeline::{PipelineFailure, PipelineRequest, PipelineResponse, Stage};
use analytics_gateway::{Gateway, GatewayConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Largest request accepted, headers included.
const MAX_REQUEST_BYTES: usize = 1 << 20;
const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Deserialize)]
struct SqlBody {
    sql: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var("GATEWAY_CONFIG") {
        Ok(path) => {
            let mut config = GatewayConfig::from_file(std::path::Path::new(&path))?;
            config.apply_env(|key| std::env::var(key).ok())?;
            config
        }
        Err(_) => GatewayConfig::from_env()?,
    };
    let bind_addr = config.bind_addr.clone();

    info!("Starting analytics gateway API server...");
    let gateway = Arc::new(Gateway::from_config(config).await?);

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Server listening on {}", bind_addr);

    // Cancelled on shutdown; every request runs under a child of it.
    let shutdown = CancellationToken::new();
    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down; cancelling in-flight requests");
                shutdown.cancel();
                break;
            }
        };
        info!("New connection from: {}", addr);
        let gateway = gateway.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            handle_connection(stream, gateway, cancel).await;
        });
    }
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, gateway: Arc<Gateway>, cancel: CancellationToken) {
    let response = match read_request(&mut stream).await {
        Ok(Some(request)) => handle_request(&request, &gateway, &cancel).await,
        Ok(None) => return,
        Err(e) => {
            warn!("Failed to read request: {}", e.message);
            create_response(e.status, e.status_text(), &error_body(&e.message))
        }
    };
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write response: {}", e);
    }
}

struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    body: String,
}

/// Why a request could not be read, with the status it maps to.
#[derive(Debug, PartialEq)]
struct RequestError {
    status: u16,
    message: String,
}

impl RequestError {
    fn bad_request(message: &str) -> Self {
        Self {
            status: 400,
            message: message.to_string(),
        }
    }

    fn too_large(message: &str) -> Self {
        Self {
            status: 413,
            message: message.to_string(),
        }
    }

    fn status_text(&self) -> &'static str {
        match self.status {
            413 => "Payload Too Large",
            _ => "Bad Request",
        }
    }
}

/// Request line and headers, plus where the body ends in the buffer.
#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    body_end: usize,
}

/// Parse the header block ending at `header_end` and bound the body it
/// announces.
fn parse_head(buffer: &[u8], header_end: usize) -> Result<RequestHead, RequestError> {
    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(RequestError::bad_request("malformed request line"));
    }

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = match headers.get("content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| RequestError::bad_request("invalid Content-Length"))?,
        None => 0,
    };
    let body_end = header_end
        .checked_add(content_length)
        .filter(|end| *end <= MAX_REQUEST_BYTES)
        .ok_or_else(|| RequestError::too_large("request body too large"))?;

    Ok(RequestHead {
        method: parts[0].to_string(),
        target: parts[1].to_string(),
        body_end,
    })
}

/// Read headers, then as many body bytes as `Content-Length` announces.
async fn read_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>, RequestError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let io_error = |e: std::io::Error| RequestError::bad_request(&e.to_string());
    let header_end = loop {
        let n = stream.read(&mut chunk).await.map_err(io_error)?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(RequestError::bad_request("connection closed before headers were complete"));
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buffer, b"\r\n\r\n") {
            break pos + 4;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            return Err(RequestError::too_large("request headers too large"));
        }
    };

    let head = parse_head(&buffer, header_end)?;
    while buffer.len() < head.body_end {
        let n = stream.read(&mut chunk).await.map_err(io_error)?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    let body_end = buffer.len().min(head.body_end);
    let body = String::from_utf8_lossy(&buffer[header_end..body_end]).to_string();

    let (path, query) = split_target(&head.target);
    Ok(Some(HttpRequest {
        method: head.method,
        path,
        query,
        body,
    }))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, raw_query) = target.split_once('?').unwrap_or((target, ""));
    let query = raw_query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    // Normalize path (remove trailing slash except for root)
    let mut path = path.trim_end_matches('/').to_string();
    if path.is_empty() {
        path = "/".to_string();
    }
    (path, query)
}

async fn handle_request(request: &HttpRequest, gateway: &Gateway, cancel: &CancellationToken) -> String {
    info!("Request: {} {}", request.method, request.path);
    let csv = request.query.get("format").map(|f| f.eq_ignore_ascii_case("csv")).unwrap_or(false);

    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => create_response(204, "No Content", ""),
        ("GET", "/api/health") => json_response(200, "OK", &gateway.health().await),
        ("GET", "/api/tables") => {
            let snapshot = gateway.snapshot();
            let tables: Vec<_> = snapshot.tables().collect();
            json_response(
                200,
                "OK",
                &serde_json::json!({
                    "snapshot_version": snapshot.version(),
                    "tables": tables,
                }),
            )
        }
        ("POST", "/api/ask") => {
            let ask: PipelineRequest = match serde_json::from_str(&request.body) {
                Ok(ask) => ask,
                Err(e) => {
                    return create_response(400, "Bad Request", &error_body(&format!("invalid body: {}", e)))
                }
            };
            pipeline_response(gateway.ask(&ask, cancel).await, csv)
        }
        ("POST", "/api/sql") => {
            let body: SqlBody = match serde_json::from_str(&request.body) {
                Ok(body) => body,
                Err(e) => {
                    return create_response(400, "Bad Request", &error_body(&format!("invalid body: {}", e)))
                }
            };
            pipeline_response(gateway.run_sql(&body.sql).await, csv)
        }
        ("POST", "/api/reindex") => match gateway.reindex().await {
            Ok(summary) => json_response(200, "OK", &summary),
            Err(e) => {
                error!("Reindex failed: {}", e);
                create_response(500, "Internal Server Error", &error_body(&e.to_string()))
            }
        },
        ("GET", "/api/history") => {
            let limit = request
                .query
                .get("limit")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HISTORY_LIMIT);
            match gateway.history(limit) {
                Ok(entries) => json_response(200, "OK", &serde_json::json!({ "entries": entries })),
                Err(e) => create_response(500, "Internal Server Error", &error_body(&e.to_string())),
            }
        }
        _ => create_response(404, "Not Found", &error_body("not found")),
    }
}

/// Successful responses render as JSON, or as bare CSV rows when asked.
/// Failures are always JSON.
fn pipeline_response(outcome: Result<PipelineResponse, PipelineFailure>, csv: bool) -> String {
    match outcome {
        Ok(response) if csv => match response.to_csv() {
            Ok(body) => create_response_with_type(200, "OK", "text/csv", &body),
            Err(e) => create_response(500, "Internal Server Error", &error_body(&e.to_string())),
        },
        Ok(response) => json_response(200, "OK", &response),
        Err(failure) => {
            let (status, text) = failure_status(&failure);
            json_response(status, text, &serde_json::json!({ "error": failure }))
        }
    }
}

fn failure_status(failure: &PipelineFailure) -> (u16, &'static str) {
    match (failure.kind.as_str(), failure.stage) {
        ("invalid_request", _) => (400, "Bad Request"),
        ("cancelled", _) => (503, "Service Unavailable"),
        ("timeout", _) => (504, "Gateway Timeout"),
        (_, Stage::Validation) | (_, Stage::Execution) => (422, "Unprocessable Entity"),
        _ => (502, "Bad Gateway"),
    }
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": { "reason": message } }).to_string()
}

fn json_response<T: serde::Serialize>(status: u16, status_text: &str, value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(body) => create_response(status, status_text, &body),
        Err(e) => create_response(500, "Internal Server Error", &error_body(&e.to_string())),
    }
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    create_response_with_type(status, status_text, "application/json", body)
}

fn create_response_with_type(status: u16, status_text: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text,
        content_type,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_of(raw: &str) -> (Vec<u8>, usize) {
        let bytes = raw.as_bytes().to_vec();
        let header_end = find_subslice(&bytes, b"\r\n\r\n").unwrap() + 4;
        (bytes, header_end)
    }

    #[test]
    fn test_parse_head_bounds_body() {
        let (bytes, header_end) = head_of("POST /api/sql?format=csv HTTP/1.1\r\nContent-Length: 12\r\n\r\n");
        let head = parse_head(&bytes, header_end).unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.body_end, header_end + 12);

        let (path, query) = split_target(&head.target);
        assert_eq!(path, "/api/sql");
        assert_eq!(query.get("format").map(String::as_str), Some("csv"));
    }

    #[test]
    fn test_overflowing_content_length_is_rejected() {
        let raw = format!("POST /api/ask HTTP/1.1\r\nContent-Length: {}\r\n\r\n", usize::MAX);
        let (bytes, header_end) = head_of(&raw);
        let err = parse_head(&bytes, header_end).unwrap_err();
        assert_eq!(err.status, 413);
        assert_eq!(err.status_text(), "Payload Too Large");

        let raw = format!("POST /api/ask HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_REQUEST_BYTES);
        let (bytes, header_end) = head_of(&raw);
        assert_eq!(parse_head(&bytes, header_end).unwrap_err().status, 413);
    }

    #[test]
    fn test_malformed_heads_are_bad_requests() {
        let (bytes, header_end) = head_of("POST /api/ask HTTP/1.1\r\nContent-Length: -5\r\n\r\n");
        assert_eq!(
            parse_head(&bytes, header_end).unwrap_err(),
            RequestError::bad_request("invalid Content-Length")
        );

        let (bytes, header_end) = head_of("GARBAGE\r\n\r\n");
        assert_eq!(parse_head(&bytes, header_end).unwrap_err().status, 400);
    }

    #[test]
    fn test_csv_format_changes_content_type() {
        let response = create_response_with_type(200, "OK", "text/csv", "sku\nA\n");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\nContent-Type: text/csv\r\n"));
        assert!(response.ends_with("\r\n\r\nsku\nA\n"));
        assert!(create_response(404, "Not Found", "{}").contains("Content-Type: application/json"));
    }
}
