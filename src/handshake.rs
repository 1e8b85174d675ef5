use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};

/// Fixed GUID appended to the client key before hashing, per RFC 6455.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header fields scanned out of a session's first read. Empty values are
/// treated as absent, matching how the peer ecosystem fills these in.
#[derive(Debug, Default)]
pub struct HandshakeFields {
    pub upgrade: Option<String>,
    pub connection: Option<String>,
    pub key: Option<String>,
    pub target: Option<String>,
}

/// What the session should do with the connection after the first read.
#[derive(Debug)]
pub enum Classification {
    /// The client already performed its own WebSocket handshake with the
    /// upstream; pass every byte through, starting with the initial read.
    Relay { target: Option<String> },
    /// The client expects this proxy to answer the upgrade. Missing fields
    /// have been synthesized.
    Forge {
        upgrade: String,
        connection: String,
        key: String,
        target: Option<String>,
    },
}

impl HandshakeFields {
    /// Scans CRLF-delimited header lines for the fields the relay cares
    /// about. Names match case-insensitively on the prefix up to the first
    /// colon; values are the trimmed remainder.
    #[must_use]
    pub fn parse(head: &str) -> Self {
        Self {
            upgrade: find_header(head, "Upgrade"),
            connection: find_header(head, "Connection"),
            key: find_header(head, "Sec-WebSocket-Key"),
            target: find_header(head, "X-Real-Host"),
        }
    }

    /// All three upgrade headers present means the client speaks WebSocket
    /// on its own and this session is a pure byte relay.
    #[must_use]
    pub fn classify(self) -> Classification {
        if self.upgrade.is_some() && self.connection.is_some() && self.key.is_some() {
            Classification::Relay {
                target: self.target,
            }
        } else {
            Classification::Forge {
                upgrade: self.upgrade.unwrap_or_else(|| "websocket".to_string()),
                connection: self.connection.unwrap_or_else(|| "Upgrade".to_string()),
                key: self.key.unwrap_or_else(synthesize_key),
                target: self.target,
            }
        }
    }
}

fn find_header(head: &str, name: &str) -> Option<String> {
    for line in head.split("\r\n") {
        if let Some((prefix, value)) = line.split_once(':') {
            if prefix.eq_ignore_ascii_case(name) {
                let value = value.trim();
                if value.is_empty() {
                    return None;
                }
                return Some(value.to_string());
            }
        }
    }
    None
}

/// A stand-in `Sec-WebSocket-Key`: 16 random bytes, base64-encoded, exactly
/// as a conforming client would have produced.
#[must_use]
pub fn synthesize_key() -> String {
    BASE64.encode(rand::random::<[u8; 16]>())
}

/// Derives `Sec-WebSocket-Accept` from the key actually in play.
#[must_use]
pub fn accept_token(key: &str) -> String {
    let digest = Sha1::digest(format!("{key}{WEBSOCKET_GUID}").as_bytes());
    BASE64.encode(digest)
}

/// The upgrade response sent when the handshake is forged on the client's
/// behalf. The status code stays 101 so clients that validate the status
/// line keep working; the reason phrase is configurable.
#[must_use]
pub fn upgrade_response(upgrade: &str, connection: &str, accept: &str, reason: &str) -> String {
    format!(
        "HTTP/1.1 101 {reason}\r\n\
         Upgrade: {upgrade}\r\n\
         Connection: {connection}\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}
