mod codec;

pub use codec::{ProtocolError, RespCodec, RespVersion, MAX_AGGREGATE_LEN, MAX_BULK_LEN, MAX_DEPTH};

use bytes::Bytes;

pub const CMD_AUTH: &[u8] = b"AUTH";
pub const CMD_MULTI: &[u8] = b"MULTI";
pub const CMD_WATCH: &[u8] = b"WATCH";
pub const CMD_EXEC: &[u8] = b"EXEC";
pub const CMD_DISCARD: &[u8] = b"DISCARD";

/// Whether a command opens or closes a transaction window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    /// MULTI / WATCH
    Begin,
    /// EXEC / DISCARD
    End,
}

/// One RESP frame, covering the RESP2 and RESP3 type families.
///
/// Maps and attributes are stored as key/value pairs so the even-count
/// wire invariant holds by construction. Null bulk, null array and null
/// map are distinct variants: decoding is lossless and re-encoding emits
/// the exact null spelling that was read.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Bytes),
    NullBulk,
    Array(Vec<RespValue>),
    NullArray,
    /// RESP3 `_\r\n`
    Null,
    Boolean(bool),
    /// Lexical form preserved; the proxy never needs the numeric value.
    Double(Bytes),
    BigNumber(Bytes),
    VerbatimString {
        format: [u8; 3],
        data: Bytes,
    },
    BlobError(Bytes),
    Map(Vec<(RespValue, RespValue)>),
    NullMap,
    Set(Vec<RespValue>),
    Push(Vec<RespValue>),
    Attribute(Vec<(RespValue, RespValue)>),
}

impl RespValue {
    pub fn simple(data: &'static [u8]) -> RespValue {
        RespValue::SimpleString(Bytes::from_static(data))
    }

    pub fn bulk(data: impl Into<Bytes>) -> RespValue {
        RespValue::BulkString(data.into())
    }

    pub fn error_msg(msg: impl Into<String>) -> RespValue {
        RespValue::Error(Bytes::from(msg.into()))
    }

    /// Build a command frame (array of bulk strings) from raw parts.
    pub fn command_frame<I, T>(parts: I) -> RespValue
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        RespValue::Array(
            parts
                .into_iter()
                .map(|part| RespValue::BulkString(part.into()))
                .collect(),
        )
    }

    /// Leaf payload bytes, if this frame carries any.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            RespValue::SimpleString(data)
            | RespValue::Error(data)
            | RespValue::BulkString(data)
            | RespValue::Double(data)
            | RespValue::BigNumber(data)
            | RespValue::BlobError(data) => Some(data.as_ref()),
            RespValue::VerbatimString { data, .. } => Some(data.as_ref()),
            _ => None,
        }
    }

    /// The command word of a request frame: the first element of an
    /// array, or the frame's own payload for inline-style values.
    pub fn command(&self) -> Option<&[u8]> {
        match self {
            RespValue::Array(items) => items.first().and_then(|item| item.payload()),
            other => other.payload(),
        }
    }

    pub fn is_auth_cmd(&self) -> bool {
        match self {
            RespValue::Array(items) if items.len() >= 2 => items
                .first()
                .and_then(|item| item.payload())
                .map(|cmd| cmd.eq_ignore_ascii_case(CMD_AUTH))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// MULTI/WATCH open a transaction window, EXEC/DISCARD close it.
    pub fn tx_kind(&self) -> Option<TxKind> {
        let cmd = self.command()?;
        if cmd.eq_ignore_ascii_case(CMD_MULTI) || cmd.eq_ignore_ascii_case(CMD_WATCH) {
            Some(TxKind::Begin)
        } else if cmd.eq_ignore_ascii_case(CMD_EXEC) || cmd.eq_ignore_ascii_case(CMD_DISCARD) {
            Some(TxKind::End)
        } else {
            None
        }
    }

    pub fn is_ok_status(&self) -> bool {
        matches!(self, RespValue::SimpleString(data) if data.eq_ignore_ascii_case(b"OK"))
    }
}

/// Canonical error replies the proxy synthesizes itself.
pub fn err_no_auth() -> RespValue {
    RespValue::Error(Bytes::from_static(b"NOAUTH Authentication required"))
}

pub fn err_wrong_pass() -> RespValue {
    RespValue::Error(Bytes::from_static(
        b"WRONGPASS invalid username-password pair or user is disabled",
    ))
}

pub fn err_backend_unavailable() -> RespValue {
    RespValue::Error(Bytes::from_static(b"ERR backend is unavailable"))
}

pub fn err_pool_unavailable() -> RespValue {
    RespValue::Error(Bytes::from_static(
        b"ERR can not get backend connection from pool",
    ))
}

pub fn ok_status() -> RespValue {
    RespValue::simple(b"OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&'static [u8]]) -> RespValue {
        RespValue::command_frame(parts.iter().copied().map(Bytes::from_static))
    }

    #[test]
    fn detects_auth_command() {
        assert!(cmd(&[b"AUTH", b"secret"]).is_auth_cmd());
        assert!(cmd(&[b"auth", b"user", b"secret"]).is_auth_cmd());
        assert!(!cmd(&[b"AUTH"]).is_auth_cmd());
        assert!(!cmd(&[b"GET", b"key"]).is_auth_cmd());
        assert!(!RespValue::simple(b"AUTH").is_auth_cmd());
    }

    #[test]
    fn detects_transaction_commands() {
        assert_eq!(cmd(&[b"MULTI"]).tx_kind(), Some(TxKind::Begin));
        assert_eq!(cmd(&[b"watch", b"k"]).tx_kind(), Some(TxKind::Begin));
        assert_eq!(cmd(&[b"EXEC"]).tx_kind(), Some(TxKind::End));
        assert_eq!(cmd(&[b"discard"]).tx_kind(), Some(TxKind::End));
        assert_eq!(cmd(&[b"SET", b"k", b"v"]).tx_kind(), None);
    }

    #[test]
    fn command_word_of_inline_value() {
        assert_eq!(RespValue::simple(b"PING").command(), Some(&b"PING"[..]));
        assert_eq!(cmd(&[b"GET", b"k"]).command(), Some(&b"GET"[..]));
    }

    #[test]
    fn ok_status_is_case_insensitive() {
        assert!(RespValue::simple(b"OK").is_ok_status());
        assert!(RespValue::simple(b"ok").is_ok_status());
        assert!(!RespValue::bulk(&b"OK"[..]).is_ok_status());
        assert!(!RespValue::simple(b"QUEUED").is_ok_status());
    }
}
