use crate::protocol::server::ServiceContext;
use crate::protocol::{Protocol, Request, Response};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;
pub const MAX_LINE_LEN: usize = 8 * 1024;
const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
    pub keep_alive: bool,
}

pub async fn handle_connection(stream: TcpStream, ctx: Arc<ServiceContext>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(request) = read_request(&mut reader).await? {
        let (status, response) = if request.method != "POST" {
            (405, Response::error(format!("{} not allowed; use POST", request.method)))
        } else {
            match serde_json::from_slice::<Request>(&request.body) {
                Ok(call) => (200, ctx.dispatch(Protocol::Http, call).await?),
                Err(e) => (400, Response::error(format!("Invalid JSON request: {}", e))),
            }
        };

        let body = serde_json::to_vec(&response).context("Failed to encode response")?;
        write_response(&mut writer, status, &body, request.keep_alive).await?;

        if !request.keep_alive {
            break;
        }
    }

    Ok(())
}

/// Returns `None` when the peer closes the connection between requests.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<HttpRequest>> {
    let mut line = String::new();
    if read_line(reader, &mut line).await? == 0 {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), Some(version)) => {
            (method.to_string(), path.to_string(), version.to_string())
        }
        _ => anyhow::bail!("Malformed request line: {}", line.trim_end()),
    };

    let mut keep_alive = version == "HTTP/1.1";
    let mut content_length = 0usize;
    let mut headers = 0usize;

    loop {
        if read_line(reader, &mut line).await? == 0 {
            anyhow::bail!("Connection closed inside request headers");
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }

        headers += 1;
        if headers > MAX_HEADERS {
            anyhow::bail!("Too many request headers");
        }

        let Some((name, value)) = header.split_once(':') else {
            anyhow::bail!("Malformed header: {}", header);
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .with_context(|| format!("Invalid Content-Length: {}", value))?;
        } else if name.eq_ignore_ascii_case("connection") {
            if value.eq_ignore_ascii_case("close") {
                keep_alive = false;
            } else if value.eq_ignore_ascii_case("keep-alive") {
                keep_alive = true;
            }
        }
    }

    if content_length > MAX_BODY_LEN {
        anyhow::bail!("Request body of {} bytes exceeds limit", content_length);
    }
    let mut body = vec![0u8; content_length];
    reader
        .read_exact(&mut body)
        .await
        .context("Failed to read request body")?;

    Ok(Some(HttpRequest {
        method,
        path,
        body,
        keep_alive,
    }))
}

/// Reads one line of at most `MAX_LINE_LEN` bytes into `line`.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, line: &mut String) -> Result<usize> {
    line.clear();
    let read = (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_line(line)
        .await?;
    if read == MAX_LINE_LEN && !line.ends_with('\n') {
        anyhow::bail!("Request header line exceeds limit");
    }
    Ok(read)
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    body: &[u8],
    keep_alive: bool,
) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        status,
        status_text(status),
        body.len(),
        if keep_alive { "keep-alive" } else { "close" }
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await.context("Failed to flush response")?;
    Ok(())
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        405 => "Method Not Allowed",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_post_with_body() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\n{}";
        let mut reader = BufReader::new(&raw[..]);

        let request = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/");
        assert_eq!(request.body, b"{}");
        assert!(request.keep_alive);
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connection_close_and_http10() {
        let raw = b"POST / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let request = read_request(&mut BufReader::new(&raw[..])).await.unwrap().unwrap();
        assert!(!request.keep_alive);

        let raw = b"GET /x HTTP/1.0\r\n\r\n";
        let request = read_request(&mut BufReader::new(&raw[..])).await.unwrap().unwrap();
        assert!(!request.keep_alive);
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn truncated_headers_are_an_error() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n";
        assert!(read_request(&mut BufReader::new(&raw[..])).await.is_err());
    }

    #[tokio::test]
    async fn oversized_header_line_is_rejected() {
        let mut raw = b"POST / HTTP/1.1\r\nX-Pad: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_BODY_LEN + 1024));
        raw.extend_from_slice(b"\r\n\r\n");

        let err = read_request(&mut BufReader::new(&raw[..])).await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn oversized_request_line_is_rejected() {
        let mut raw = b"POST /".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_LINE_LEN));
        assert!(read_request(&mut BufReader::new(&raw[..])).await.is_err());
    }

    #[tokio::test]
    async fn header_line_just_under_the_limit_is_accepted() {
        let mut raw = b"POST / HTTP/1.1\r\nX-Pad: ".to_vec();
        let pad = MAX_LINE_LEN - "X-Pad: \r\n".len();
        raw.extend(std::iter::repeat(b'a').take(pad));
        raw.extend_from_slice(b"\r\n\r\n");

        let request = read_request(&mut BufReader::new(&raw[..])).await.unwrap().unwrap();
        assert_eq!(request.method, "POST");
    }
}
