//! Run-config fetch from the microvm metadata service.
//!
//! Firecracker exposes MMDS as a link-local HTTP/1.1 endpoint. The exchange
//! is small enough that the request is written and parsed directly on the
//! TCP stream: token-authenticated V2 first, unauthenticated V1 as the
//! fallback, everything under one caller-supplied deadline.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::RunConfig;
use crate::error::InitError;

const MMDS_ADDR: &str = "169.254.169.254:80";
const TOKEN_TTL_SECS: &str = "60";

/// Fetch the run config from MMDS, V2 first with a V1 fallback, within
/// `timeout`.
pub async fn fetch(timeout: Duration) -> Result<RunConfig, InitError> {
    let deadline = tokio::time::Instant::now() + timeout;

    let data = match tokio::time::timeout_at(deadline, fetch_v2()).await {
        Ok(Ok(data)) => data,
        // V2 failed or timed out; whatever deadline remains goes to V1.
        _ => tokio::time::timeout_at(deadline, fetch_v1())
            .await
            .map_err(|_| InitError::DeadlineExceeded)?
            .map_err(|e| InitError::ConfigLoadFailed(format!("mmds: {e}")))?,
    };

    serde_json::from_slice(&data)
        .map_err(|e| InitError::ConfigLoadFailed(format!("mmds: parse config: {e}")))
}

/// V2 flow: PUT a session token request, then GET the metadata root with it.
async fn fetch_v2() -> std::io::Result<Vec<u8>> {
    let (status, token) = request(
        "PUT",
        "/latest/api/token",
        &[("X-metadata-token-ttl-seconds", TOKEN_TTL_SECS)],
    )
    .await?;
    if status != 200 {
        return Err(std::io::Error::other(format!("v2 token: status {status}")));
    }
    let token = String::from_utf8_lossy(&token).trim().to_string();

    let (status, body) = request(
        "GET",
        "/",
        &[
            ("X-metadata-token", &token),
            ("Accept", "application/json"),
        ],
    )
    .await?;
    if status != 200 {
        return Err(std::io::Error::other(format!("v2 get: status {status}")));
    }
    Ok(body)
}

async fn fetch_v1() -> std::io::Result<Vec<u8>> {
    let (status, body) = request("GET", "/", &[("Accept", "application/json")]).await?;
    if status != 200 {
        return Err(std::io::Error::other(format!("v1 get: status {status}")));
    }
    Ok(body)
}

/// Send one HTTP/1.1 request and read the response.
///
/// Responses are framed by `Content-Length`: read until the header/body
/// boundary, then exactly the advertised body length.
async fn request(
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> std::io::Result<(u16, Vec<u8>)> {
    let mut stream = TcpStream::connect(MMDS_ADDR).await?;

    let mut head = format!("{method} {path} HTTP/1.1\r\nHost: 169.254.169.254\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("Content-Length: 0\r\n\r\n");
    stream.write_all(head.as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(4096);

    loop {
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 || buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let header_end = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(buf.len());
    let head_text = String::from_utf8_lossy(&buf[..header_end]).to_string();

    let status = head_text
        .get(9..12)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let content_length = head_text
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    let body_start = (header_end + 4).min(buf.len());
    let mut body = buf[body_start..].to_vec();
    if body.len() < content_length {
        let mut tail = vec![0u8; content_length - body.len()];
        reader.read_exact(&mut tail).await?;
        body.extend_from_slice(&tail);
    }
    body.truncate(content_length);

    Ok((status, body))
}
