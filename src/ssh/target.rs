//! Target Specification & Connection Identity
//!
//! A target is a `user@host[:port]` string. Parsing decomposes and validates
//! it; identity derivation hashes it. Keying is on the **exact raw string**:
//! `root@web1` and `root@web1:22` are the same logical host but distinct
//! connections, sockets, and cache entries. No normalization is applied.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MuxError;

/// Default SSH port when the target omits one.
pub const DEFAULT_PORT: u16 = 22;

/// Hex characters kept from the SHA-256 digest for a connection id.
const CONNECTION_ID_LEN: usize = 16;

/// A validated remote target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub user: String,
    pub host: String,
    pub port: u16,
    /// The exact string the caller supplied; the sole keying input.
    raw: String,
}

impl Target {
    /// Parse and validate a `user@host[:port]` specification.
    ///
    /// Rejected with [`MuxError::InvalidTargetFormat`]: empty input, zero or
    /// multiple `@`, empty user or host, and a non-numeric or out-of-range
    /// port.
    pub fn parse(raw: &str) -> Result<Self, MuxError> {
        let invalid = |reason: &str| MuxError::InvalidTargetFormat {
            input: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("empty target"));
        }

        let mut parts = raw.split('@');
        let user = parts.next().unwrap_or_default();
        let host_port = parts
            .next()
            .ok_or_else(|| invalid("expected user@host[:port]"))?;
        if parts.next().is_some() {
            return Err(invalid("multiple '@' separators"));
        }
        if user.is_empty() {
            return Err(invalid("empty user"));
        }

        // A port may itself contain no colon, so splitting on the last one
        // is unambiguous for host[:port].
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port_str)) => {
                let port: u16 = port_str
                    .parse()
                    .map_err(|_| invalid("port is not a number in [1, 65535]"))?;
                if port == 0 {
                    return Err(invalid("port is not a number in [1, 65535]"));
                }
                (host, port)
            }
            None => (host_port, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
            raw: raw.to_string(),
        })
    }

    /// The exact string the caller supplied.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// `user@host` destination form for the ssh client (port travels via `-p`).
    pub fn user_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Derive this target's connection id.
    pub fn connection_id(&self) -> ConnectionId {
        ConnectionId::derive(&self.raw)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Fixed-width identifier derived from a raw target string.
///
/// Used as the socket filename stem and the registry key. Deterministic
/// across calls and processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Derive the id for a raw target string.
    ///
    /// Pure: same input, same id. Empty input is rejected upstream by
    /// [`Target::parse`].
    pub fn derive(raw: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self(hex[..CONNECTION_ID_LEN].to_string())
    }

    /// Wrap an id recovered from a filename or registry row.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
