//! Minimal HTTP front end for the poll-based protocol. The consoles speak
//! plain HTTP/1.1 POST with raw binary bodies, one short exchange per poll,
//! so a hand-rolled request reader over a TCP accept loop is all that is
//! needed; there is no connection state to manage.

use crate::handlers::NetplayService;
use log::{debug, error, info, warn};
use std::error::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_HEADER_BYTES: usize = 8 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Binds and runs the accept loop; every connection gets its own task.
pub async fn run(addr: &str, service: NetplayService) -> Result<(), Box<dyn Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);
    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, service).await {
                debug!("connection from {} failed: {}", peer, err);
            }
        });
    }
}

struct Request {
    path: String,
    body: Vec<u8>,
}

async fn handle_connection(
    mut stream: TcpStream,
    service: NetplayService,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let request = match read_request(&mut stream).await? {
        Some(request) => request,
        None => return Ok(()), // connection closed early
    };

    match service.handle(&request.path, &request.body).await {
        Some(response) => {
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                response.len()
            );
            stream.write_all(header.as_bytes()).await?;
            stream.write_all(&response).await?;
        }
        None => {
            warn!("invalid URL {}", request.path);
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
        }
    }
    stream.shutdown().await?;
    Ok(())
}

/// Reads one request: request line, headers (only Content-Length matters),
/// then exactly the announced body.
async fn read_request(
    stream: &mut TcpStream,
) -> Result<Option<Request>, Box<dyn Error + Send + Sync>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Err("request header too large".into());
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let header_text = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string();

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    if content_length > MAX_BODY_BYTES {
        return Err("request body too large".into());
    }

    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            error!(
                "body truncated: got {} of {} bytes",
                body.len(),
                content_length
            );
            return Err("truncated request body".into());
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(Request { path, body }))
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}
