//! # Memcache Text Protocol Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server replies without pulling
//! in a protocol dependency, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Value payloads are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns a frame error immediately.

use std::io::BufRead;

use crate::client::{CacheError, CacheResult};

/// Write primitive selector for the shared store path.
///
/// `set` overwrites unconditionally, `add` succeeds only on a vacant key,
/// `replace` only on an occupied one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
}

impl StoreMode {
    pub(crate) fn verb(self) -> &'static [u8] {
        match self {
            StoreMode::Set => b"set",
            StoreMode::Add => b"add",
            StoreMode::Replace => b"replace",
        }
    }
}

/// One parsed server reply line (plus payload for `VALUE`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `STORED` after a successful write.
    Stored,
    /// `NOT_STORED` when `add`/`replace` preconditions fail.
    NotStored,
    /// `DELETED` after a successful delete.
    Deleted,
    /// `NOT_FOUND` for a delete on a missing key.
    NotFound,
    /// `OK`, e.g. after `flush_all`.
    Ok,
    /// `END`, terminating a retrieval or stats stream.
    End,
    /// `VALUE <key> <flags> <bytes>` followed by the payload.
    Value {
        key: String,
        flags: u32,
        data: Vec<u8>,
    },
    /// `STAT <name> <value>`.
    Stat { name: String, value: String },
    /// `ERROR`, `CLIENT_ERROR ...` or `SERVER_ERROR ...`.
    Error(String),
}

/// Encodes a multi-key retrieval command into the provided buffer.
pub fn encode_get(keys: &[&str], out: &mut Vec<u8>) {
    out.extend_from_slice(b"get");
    for key in keys {
        out.push(b' ');
        out.extend_from_slice(key.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
}

/// Encodes a storage command (`set`/`add`/`replace`) into the provided buffer.
///
/// `flags` carries the expansion-length metadata: 0 means the payload is
/// stored as-is, nonzero is the original uncompressed length.
pub fn encode_store(
    mode: StoreMode,
    key: &str,
    flags: u32,
    expire_secs: u64,
    data: &[u8],
    out: &mut Vec<u8>,
) {
    out.extend_from_slice(mode.verb());
    out.push(b' ');
    out.extend_from_slice(key.as_bytes());
    out.push(b' ');
    push_uint(out, flags as u64);
    out.push(b' ');
    push_uint(out, expire_secs);
    out.push(b' ');
    push_uint(out, data.len() as u64);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Encodes a delete command into the provided buffer.
pub fn encode_delete(key: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(b"delete ");
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Encodes a cluster-wide invalidation command into the provided buffer.
pub fn encode_flush(out: &mut Vec<u8>) {
    out.extend_from_slice(b"flush_all\r\n");
}

/// Encodes a statistics request into the provided buffer.
pub fn encode_stats(out: &mut Vec<u8>) {
    out.extend_from_slice(b"stats\r\n");
}

/// Reads one reply from the buffered reader.
pub fn read_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> CacheResult<Reply> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(CacheError::Frame);
    }

    let mut tokens = line_buf.splitn(2, |b| *b == b' ');
    let head = tokens.next().unwrap_or(b"");
    let rest = tokens.next().unwrap_or(b"");

    match head {
        b"STORED" => Ok(Reply::Stored),
        b"NOT_STORED" => Ok(Reply::NotStored),
        b"DELETED" => Ok(Reply::Deleted),
        b"NOT_FOUND" => Ok(Reply::NotFound),
        b"OK" => Ok(Reply::Ok),
        b"END" => Ok(Reply::End),
        b"VALUE" => {
            let (key, flags, len) = parse_value_header(rest)?;
            let data = read_payload(reader, len, line_buf)?;
            Ok(Reply::Value { key, flags, data })
        }
        b"STAT" => {
            let mut fields = rest.splitn(2, |b| *b == b' ');
            let name = fields.next().unwrap_or(b"");
            let value = fields.next().unwrap_or(b"");
            Ok(Reply::Stat {
                name: String::from_utf8_lossy(name).into_owned(),
                value: String::from_utf8_lossy(value).into_owned(),
            })
        }
        b"ERROR" | b"CLIENT_ERROR" | b"SERVER_ERROR" => {
            Ok(Reply::Error(String::from_utf8_lossy(line_buf).into_owned()))
        }
        _ => Err(CacheError::Frame),
    }
}

fn parse_value_header(rest: &[u8]) -> CacheResult<(String, u32, usize)> {
    // VALUE <key> <flags> <bytes> [<cas>]; the cas token is ignored.
    let mut fields = rest.split(|b| *b == b' ');
    let key = fields.next().filter(|k| !k.is_empty()).ok_or(CacheError::Frame)?;
    let flags = parse_uint(fields.next().ok_or(CacheError::Frame)?)?;
    let len = parse_uint(fields.next().ok_or(CacheError::Frame)?)? as usize;

    if flags > u32::MAX as u64 {
        return Err(CacheError::Frame);
    }

    Ok((
        String::from_utf8_lossy(key).into_owned(),
        flags as u32,
        len,
    ))
}

fn read_payload<R: BufRead>(reader: &mut R, len: usize, line_buf: &mut Vec<u8>) -> CacheResult<Vec<u8>> {
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(CacheError::Frame);
    }

    line_buf.clear();
    Ok(data)
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> CacheResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(CacheError::Frame);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(CacheError::Frame);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_uint(data: &[u8]) -> CacheResult<u64> {
    if data.is_empty() {
        return Err(CacheError::Frame);
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(CacheError::Frame);
        }
        value = value
            .saturating_mul(10)
            .saturating_add((b - b'0') as u64);
    }
    Ok(value)
}

fn push_uint(out: &mut Vec<u8>, mut value: u64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encodes_multi_get() {
        let mut buf = Vec::new();
        encode_get(&["alpha", "beta"], &mut buf);
        assert_eq!(&buf, b"get alpha beta\r\n");
    }

    #[test]
    fn encodes_store_with_flags() {
        let mut buf = Vec::new();
        encode_store(StoreMode::Add, "key", 128, 90, b"hello", &mut buf);
        assert_eq!(&buf, b"add key 128 90 5\r\nhello\r\n");
    }

    #[test]
    fn encodes_delete() {
        let mut buf = Vec::new();
        encode_delete("key", &mut buf);
        assert_eq!(&buf, b"delete key\r\n");
    }

    #[test]
    fn parses_value_with_payload() {
        let mut reader = Cursor::new(b"VALUE key 7 5\r\nhello\r\nEND\r\n".to_vec());
        let mut line = Vec::new();
        let reply = read_reply(&mut reader, &mut line).unwrap();
        assert_eq!(
            reply,
            Reply::Value {
                key: "key".to_string(),
                flags: 7,
                data: b"hello".to_vec(),
            }
        );
        let end = read_reply(&mut reader, &mut line).unwrap();
        assert_eq!(end, Reply::End);
    }

    #[test]
    fn parses_value_with_cas_token() {
        let mut reader = Cursor::new(b"VALUE key 0 2 31337\r\nok\r\n".to_vec());
        let mut line = Vec::new();
        let reply = read_reply(&mut reader, &mut line).unwrap();
        assert_eq!(
            reply,
            Reply::Value {
                key: "key".to_string(),
                flags: 0,
                data: b"ok".to_vec(),
            }
        );
    }

    #[test]
    fn parses_store_replies() {
        let mut reader = Cursor::new(b"STORED\r\nNOT_STORED\r\n".to_vec());
        let mut line = Vec::new();
        assert_eq!(read_reply(&mut reader, &mut line).unwrap(), Reply::Stored);
        assert_eq!(read_reply(&mut reader, &mut line).unwrap(), Reply::NotStored);
    }

    #[test]
    fn parses_stat_with_spaces_in_value() {
        let mut reader = Cursor::new(b"STAT version 1.6.21 mock\r\n".to_vec());
        let mut line = Vec::new();
        let reply = read_reply(&mut reader, &mut line).unwrap();
        assert_eq!(
            reply,
            Reply::Stat {
                name: "version".to_string(),
                value: "1.6.21 mock".to_string(),
            }
        );
    }

    #[test]
    fn parses_server_error_as_reply() {
        let mut reader = Cursor::new(b"SERVER_ERROR out of memory\r\n".to_vec());
        let mut line = Vec::new();
        let reply = read_reply(&mut reader, &mut line).unwrap();
        assert_eq!(reply, Reply::Error("SERVER_ERROR out of memory".to_string()));
    }

    #[test]
    fn rejects_garbage_line() {
        let mut reader = Cursor::new(b"WHATEVER\r\n".to_vec());
        let mut line = Vec::new();
        assert!(read_reply(&mut reader, &mut line).is_err());
    }

    #[test]
    fn rejects_missing_crlf_after_payload() {
        let mut reader = Cursor::new(b"VALUE key 0 2\r\nokXX".to_vec());
        let mut line = Vec::new();
        assert!(read_reply(&mut reader, &mut line).is_err());
    }
}
