//! Shared test helpers.

use std::io::{Read, Write};
use std::net::TcpListener;

/// Serve a fixed sequence of `(status, body)` JSON responses on a local
/// port, one connection per response. Each request is fully drained (head
/// plus content-length body) before the response is written, so clients
/// never observe a reset mid-write.
pub fn spawn_scripted_server(responses: Vec<(u16, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    std::thread::spawn(move || {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut received = Vec::new();
            let mut buffer = [0u8; 8192];
            loop {
                let Ok(read) = stream.read(&mut buffer) else { break };
                if read == 0 {
                    break;
                }
                received.extend_from_slice(&buffer[..read]);
                let head_end = received.windows(4).position(|window| window == b"\r\n\r\n");
                if let Some(pos) = head_end {
                    let head = String::from_utf8_lossy(&received[..pos]).to_lowercase();
                    let content_length = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if received.len() >= pos + 4 + content_length {
                        break;
                    }
                }
            }

            let reason = if status == 200 { "OK" } else { "Error" };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    format!("http://{addr}")
}
