//! Minimal HTTP/1.x wire handling for the proxy path.
//!
//! Requests are never fully parsed: routing only needs the `Host` header, and
//! responses only need enough framing (`Content-Length` or connection-close)
//! to know when the upstream message is complete. Everything else is relayed
//! verbatim.

use bytes::Bytes;

/// Extracts the routing domain from a raw HTTP request.
///
/// The first header line named `Host` (case-insensitive) wins; later
/// duplicates are ignored. The value is trimmed and truncated at the next `:`
/// so `Host: example.com:8080` routes as `example.com`. Returns `None` when
/// the header is missing or empty.
pub fn extract_host(request: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(request);
    for line in text.lines() {
        if line.is_empty() {
            // End of the header section; anything beyond is body.
            return None;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("host") {
            continue;
        }
        let host = value.trim().split(':').next().unwrap_or("").to_string();
        return if host.is_empty() { None } else { Some(host) };
    }
    None
}

/// Builds a complete plain-text HTTP/1.1 response.
///
/// Every response the balancer originates closes the connection; relayed
/// upstream responses pass through untouched and are not built here.
pub fn plain_response(status: u16, reason: &str, body: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    ))
}

/// Byte offset of the end of the header section (past the blank line), if the
/// buffer contains one yet.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// `Content-Length` declared in a response head, if any.
pub fn content_length(head: &[u8]) -> Option<usize> {
    let text = String::from_utf8_lossy(head);
    for line in text.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse().ok();
        }
    }
    None
}
