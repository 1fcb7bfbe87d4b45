//! Log entry and its durable line codec.
//!
//! On-disk format, one entry per line, UTF-8:
//!
//! ```text
//! <crc32:08x> <index:016x> <term:016x> <name> <payload>\n
//! ```
//!
//! The checksum is IEEE crc32 over everything after the checksum
//! field, trailing newline included. Index and term are zero-padded
//! 16-digit hex; `name` is the registered command name (no spaces);
//! `payload` runs to end of line and may itself contain spaces, but
//! never a newline (JSON payloads satisfy this by construction).
//!
//! Encode→decode round-trips byte-identically; decode rejects any
//! line whose checksum does not match.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::types::{LogIndex, Term};

/// A single replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log (strictly positive, strictly increasing).
    pub index: LogIndex,

    /// Term when the entry was created (never decreases across the log).
    pub term: Term,

    /// Registered command name.
    pub name: String,

    /// Opaque command payload, typically JSON.
    pub payload: Bytes,
}

impl LogEntry {
    pub fn new(
        index: LogIndex,
        term: Term,
        name: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            index,
            term,
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// Encode this entry as its durable line, trailing newline included.
    pub fn encode(&self) -> Result<String> {
        if self.name.is_empty() || self.name.contains(' ') {
            return Err(RaftError::Codec {
                reason: format!("invalid command name {:?}", self.name),
            });
        }
        let payload = std::str::from_utf8(&self.payload).map_err(|_| RaftError::Codec {
            reason: "payload is not valid UTF-8".to_string(),
        })?;
        if payload.contains('\n') {
            return Err(RaftError::Codec {
                reason: "payload contains a newline".to_string(),
            });
        }
        let body = format!(
            "{:016x} {:016x} {} {}\n",
            self.index.as_u64(),
            self.term.as_u64(),
            self.name,
            payload
        );
        let checksum = crc32fast::hash(body.as_bytes());
        Ok(format!("{:08x} {}", checksum, body))
    }

    /// Decode a durable line (with or without its trailing newline),
    /// verifying the checksum.
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let (checksum_hex, body) = line.split_once(' ').ok_or_else(|| RaftError::Codec {
            reason: "missing checksum field".to_string(),
        })?;
        if checksum_hex.len() != 8 {
            return Err(RaftError::Codec {
                reason: format!("checksum field has width {}", checksum_hex.len()),
            });
        }
        let expected = u32::from_str_radix(checksum_hex, 16).map_err(|_| RaftError::Codec {
            reason: "checksum is not hex".to_string(),
        })?;

        // The stored checksum covers the body plus the newline.
        let mut checked = String::with_capacity(body.len() + 1);
        checked.push_str(body);
        checked.push('\n');
        let actual = crc32fast::hash(checked.as_bytes());
        if actual != expected {
            return Err(RaftError::Codec {
                reason: format!("checksum mismatch: expected {expected:08x}, got {actual:08x}"),
            });
        }

        let mut fields = body.splitn(4, ' ');
        let index = parse_hex_u64(fields.next(), "index")?;
        let term = parse_hex_u64(fields.next(), "term")?;
        let name = fields
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| RaftError::Codec {
                reason: "missing command name".to_string(),
            })?;
        let payload = fields.next().ok_or_else(|| RaftError::Codec {
            reason: "missing payload".to_string(),
        })?;

        Ok(LogEntry::new(
            LogIndex(index),
            Term(term),
            name,
            payload.as_bytes().to_vec(),
        ))
    }
}

fn parse_hex_u64(field: Option<&str>, what: &str) -> Result<u64> {
    let field = field.ok_or_else(|| RaftError::Codec {
        reason: format!("missing {what} field"),
    })?;
    if field.len() != 16 {
        return Err(RaftError::Codec {
            reason: format!("{what} field has width {}", field.len()),
        });
    }
    u64::from_str_radix(field, 16).map_err(|_| RaftError::Codec {
        reason: format!("{what} is not hex"),
    })
}
