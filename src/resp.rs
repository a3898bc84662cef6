//! Purpose: Minimal RESP2 framing: inbound commands and outbound reply primitives.
//! Exports: `Command`, `parse_command`, `ReplyWriter`, `ReplyBuffer`, `DEFAULT_MAX_FRAME_BYTES`.
//! Role: Byte-level codec between the TCP accept loop and the command dispatcher.
//! Invariants: `parse_command` consumes bytes only once a whole command is buffered.
//! Invariants: No buffered command may exceed the configured frame limit.
//! Notes: Accepts multibulk arrays (`*N\r\n$len\r\n..`) and inline commands.
use bytes::{Buf, BufMut, BytesMut};

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 512 * 1024 * 1024;

/// One inbound command: a name followed by raw byte arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    pub name: Vec<u8>,
    pub args: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(name: impl Into<Vec<u8>>, args: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    fn from_parts(mut parts: Vec<Vec<u8>>) -> Option<Self> {
        if parts.is_empty() {
            return None;
        }
        let name = parts.remove(0);
        Some(Self { name, args: parts })
    }
}

/// Outbound reply primitives the dispatcher writes through.
pub trait ReplyWriter {
    fn write_string(&mut self, value: &str);
    fn write_error(&mut self, message: &str);
    fn write_bulk(&mut self, payload: &[u8]);
    fn write_array(&mut self, len: usize);
}

/// Accumulates encoded replies for one or more commands.
#[derive(Debug, Default)]
pub struct ReplyBuffer {
    buf: BytesMut,
}

impl ReplyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn put_line(&mut self, prefix: u8, line: &str) {
        self.buf.reserve(line.len() + 3);
        self.buf.put_u8(prefix);
        // Simple strings and errors cannot carry line breaks.
        for byte in line.bytes() {
            self.buf
                .put_u8(if byte == b'\r' || byte == b'\n' { b' ' } else { byte });
        }
        self.buf.put_slice(b"\r\n");
    }
}

impl ReplyWriter for ReplyBuffer {
    fn write_string(&mut self, value: &str) {
        self.put_line(b'+', value);
    }

    fn write_error(&mut self, message: &str) {
        self.put_line(b'-', message);
    }

    fn write_bulk(&mut self, payload: &[u8]) {
        self.buf.reserve(payload.len() + 16);
        self.buf.put_u8(b'$');
        self.buf.put_slice(payload.len().to_string().as_bytes());
        self.buf.put_slice(b"\r\n");
        self.buf.put_slice(payload);
        self.buf.put_slice(b"\r\n");
    }

    fn write_array(&mut self, len: usize) {
        self.buf.put_u8(b'*');
        self.buf.put_slice(len.to_string().as_bytes());
        self.buf.put_slice(b"\r\n");
    }
}

/// Parses one command from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Empty inline lines and
/// zero-length multibulk headers are consumed and skipped. Errors mean the
/// stream can no longer be framed and the connection should be closed.
pub fn parse_command(buf: &mut BytesMut, max_frame_bytes: usize) -> Result<Option<Command>, Error> {
    loop {
        if buf.is_empty() {
            return Ok(None);
        }
        let parsed = if buf[0] == b'*' {
            parse_multibulk(buf, max_frame_bytes)?
        } else {
            parse_inline(buf, max_frame_bytes)?
        };
        match parsed {
            Parsed::Incomplete => return Ok(None),
            Parsed::Skip(consumed) => buf.advance(consumed),
            Parsed::Command(command, consumed) => {
                buf.advance(consumed);
                return Ok(Some(command));
            }
        }
    }
}

enum Parsed {
    Incomplete,
    Skip(usize),
    Command(Command, usize),
}

fn parse_inline(buf: &[u8], max_frame_bytes: usize) -> Result<Parsed, Error> {
    let Some(end) = find_line_end(buf, 0) else {
        check_limit(buf.len(), max_frame_bytes, "too big inline request")?;
        return Ok(Parsed::Incomplete);
    };
    check_limit(end, max_frame_bytes, "too big inline request")?;

    let line = buf[..end].strip_suffix(b"\r").unwrap_or(&buf[..end]);
    let parts: Vec<Vec<u8>> = line
        .split(|byte| byte.is_ascii_whitespace())
        .filter(|part| !part.is_empty())
        .map(<[u8]>::to_vec)
        .collect();
    match Command::from_parts(parts) {
        Some(command) => Ok(Parsed::Command(command, end + 1)),
        None => Ok(Parsed::Skip(end + 1)),
    }
}

fn parse_multibulk(buf: &[u8], max_frame_bytes: usize) -> Result<Parsed, Error> {
    let mut pos = 0;
    let Some(count) = read_header(buf, &mut pos, b'*', max_frame_bytes, "invalid multibulk length")?
    else {
        return Ok(Parsed::Incomplete);
    };
    if count <= 0 {
        return Ok(Parsed::Skip(pos));
    }
    let count = usize::try_from(count).map_err(|_| protocol_error("invalid multibulk length"))?;
    if count > max_frame_bytes / 4 {
        return Err(protocol_error("invalid multibulk length"));
    }

    let mut parts = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if pos >= buf.len() {
            return Ok(Parsed::Incomplete);
        }
        if buf[pos] != b'$' {
            let found = char::from(buf[pos]);
            return Err(protocol_error(format!("expected '$', got '{found}'")));
        }
        let Some(len) = read_header(buf, &mut pos, b'$', max_frame_bytes, "invalid bulk length")?
        else {
            return Ok(Parsed::Incomplete);
        };
        let len = usize::try_from(len).map_err(|_| protocol_error("invalid bulk length"))?;
        check_limit(pos + len, max_frame_bytes, "invalid bulk length")?;
        if buf.len() < pos + len + 2 {
            return Ok(Parsed::Incomplete);
        }
        if &buf[pos + len..pos + len + 2] != b"\r\n" {
            return Err(protocol_error("bulk payload is not terminated by CRLF"));
        }
        parts.push(buf[pos..pos + len].to_vec());
        pos += len + 2;
    }

    match Command::from_parts(parts) {
        Some(command) => Ok(Parsed::Command(command, pos)),
        None => Ok(Parsed::Skip(pos)),
    }
}

/// Reads a `<prefix><integer>\r\n` header starting at `*pos`.
fn read_header(
    buf: &[u8],
    pos: &mut usize,
    prefix: u8,
    max_frame_bytes: usize,
    invalid: &str,
) -> Result<Option<i64>, Error> {
    debug_assert_eq!(buf.get(*pos), Some(&prefix));
    let Some(end) = find_line_end(buf, *pos) else {
        check_limit(buf.len(), max_frame_bytes, invalid)?;
        return Ok(None);
    };
    let digits = buf[*pos + 1..end]
        .strip_suffix(b"\r")
        .ok_or_else(|| protocol_error(invalid))?;
    let value = std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| protocol_error(invalid))?;
    *pos = end + 1;
    Ok(Some(value))
}

fn find_line_end(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .iter()
        .position(|byte| *byte == b'\n')
        .map(|offset| from + offset)
}

fn check_limit(len: usize, max_frame_bytes: usize, message: &str) -> Result<(), Error> {
    if len > max_frame_bytes {
        return Err(protocol_error(message));
    }
    Ok(())
}

fn protocol_error(message: impl AsRef<str>) -> Error {
    Error::new(ErrorKind::Usage).with_message(format!("Protocol error: {}", message.as_ref()))
}
