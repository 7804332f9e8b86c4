//! SMTP envelope dialogue
//!
//! Only the status-code prefixes are load-bearing; the capability lines keep
//! the exchange looking like a stock Postfix submission service. Status `299`
//! is private and marks the switch to binary mode.

use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Per-line read timeout during the handshake
pub const LINE_TIMEOUT: Duration = Duration::from_secs(60);

/// Replies emitted by the server side of the handshake
pub struct Reply;

impl Reply {
    pub fn greeting(hostname: &str) -> String {
        format!("220 {hostname} ESMTP Postfix (Ubuntu)\r\n")
    }

    /// EHLO capability list; `starttls` is advertised only before the upgrade
    pub fn capabilities(hostname: &str, starttls: bool) -> String {
        let mut out = format!("250-{hostname}\r\n");
        if starttls {
            out.push_str("250-STARTTLS\r\n");
        }
        out.push_str("250-AUTH PLAIN LOGIN\r\n250 8BITMIME\r\n");
        out
    }

    pub fn starttls_ready() -> String {
        "220 2.0.0 Ready to start TLS\r\n".to_string()
    }

    pub fn auth_success() -> String {
        "235 2.7.0 Authentication successful\r\n".to_string()
    }

    pub fn auth_failed() -> String {
        "535 5.7.8 Authentication failed\r\n".to_string()
    }

    pub fn binary_mode() -> String {
        "299 Binary mode activated\r\n".to_string()
    }
}

/// EHLO or HELO, case-insensitive prefix
pub fn is_ehlo(line: &str) -> bool {
    let upper = line.to_ascii_uppercase();
    upper.starts_with("EHLO") || upper.starts_with("HELO")
}

pub fn is_starttls(line: &str) -> bool {
    line.eq_ignore_ascii_case("STARTTLS")
}

/// AUTH command, case-insensitive prefix
pub fn is_auth(line: &str) -> bool {
    line.to_ascii_uppercase().starts_with("AUTH")
}

/// Extract the token from `AUTH PLAIN <token>`.
///
/// The token is the third whitespace-separated field; anything shorter is a
/// malformed AUTH line.
pub fn auth_token(line: &str) -> Option<&str> {
    if !is_auth(line) {
        return None;
    }
    line.split_whitespace().nth(2)
}

/// Read one CRLF-terminated line, buffering leftovers in `buf`.
///
/// Returns `Ok(None)` on EOF. A stalled peer (no full line within
/// [`LINE_TIMEOUT`]) is a handshake failure.
pub async fn read_line<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Option<String>>
where
    S: AsyncReadExt + Unpin,
{
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos);
            buf.advance(1);
            let text = String::from_utf8_lossy(&line);
            return Ok(Some(text.trim_end_matches('\r').trim().to_string()));
        }

        let mut chunk = [0u8; 1024];
        let n = tokio::time::timeout(LINE_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| Error::Handshake("line read timed out".into()))??;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
