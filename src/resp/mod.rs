/// RESP (REdis Serialization Protocol) framing
///
/// Three decode entry points with distinct jobs:
/// - [`read_command`] parses client ingress, accepting both the
///   array-of-bulk-strings form and the inline (whitespace-split) form.
/// - [`read_data`] parses one fully typed value; used for bootstrap
///   handshakes and topology queries, never on the reply hot path.
/// - [`read_data_bytes`] streams the raw bytes of exactly one top-level
///   value into a buffer without building a tree. Backend replies travel
///   through the proxy this way, byte-for-byte.
use std::future::Future;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{PorteroError, PorteroResult};

pub const T_SIMPLE_STRING: u8 = b'+';
pub const T_ERROR: u8 = b'-';
pub const T_INTEGER: u8 = b':';
pub const T_BULK_STRING: u8 = b'$';
pub const T_ARRAY: u8 = b'*';

const CRLF: &[u8] = b"\r\n";

/// A client command: `args[0]` is the command name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub args: Vec<String>,
}

impl Command {
    pub fn new(args: Vec<String>) -> PorteroResult<Self> {
        if args.is_empty() {
            return Err(PorteroError::protocol("empty command"));
        }
        Ok(Self { args })
    }

    /// Build a command from string literals; intended for fixed commands
    pub fn from_slice(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn name(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }

    /// `args[index]`, or the empty string when out of range
    pub fn arg(&self, index: usize) -> &str {
        self.args.get(index).map(String::as_str).unwrap_or("")
    }

    /// `args[index]` parsed as an integer, or 0
    pub fn int_arg(&self, index: usize) -> i64 {
        self.arg(index).parse().unwrap_or(0)
    }

    /// Encode as an array of bulk strings
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 * self.args.len());
        buf.put_u8(T_ARRAY);
        buf.extend_from_slice(self.args.len().to_string().as_bytes());
        buf.extend_from_slice(CRLF);
        for arg in &self.args {
            buf.put_u8(T_BULK_STRING);
            buf.extend_from_slice(arg.len().to_string().as_bytes());
            buf.extend_from_slice(CRLF);
            buf.extend_from_slice(arg.as_bytes());
            buf.extend_from_slice(CRLF);
        }
        buf.freeze()
    }
}

/// A fully parsed RESP value
#[derive(Debug, Clone, PartialEq)]
pub enum RespData {
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// `None` is the nil bulk string (`$-1`)
    BulkString(Option<Bytes>),
    /// `None` is the nil array (`*-1`)
    Array(Option<Vec<RespData>>),
}

impl RespData {
    pub fn ok() -> Self {
        RespData::SimpleString("OK".to_string())
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        RespData::Error(message.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespData::Error(_))
    }

    /// The bulk string payload as UTF-8, when this value is a bulk string
    pub fn bulk_str(&self) -> Option<&str> {
        match self {
            RespData::BulkString(Some(data)) => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            RespData::SimpleString(s) => {
                buf.put_u8(T_SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespData::Error(s) => {
                buf.put_u8(T_ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespData::Integer(n) => {
                buf.put_u8(T_INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespData::BulkString(Some(data)) => {
                buf.put_u8(T_BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespData::BulkString(None) => buf.extend_from_slice(b"$-1\r\n"),
            RespData::Array(Some(elements)) => {
                buf.put_u8(T_ARRAY);
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for element in elements {
                    element.encode_into(buf);
                }
            }
            RespData::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
        }
    }

    /// Re-parse a complete in-memory reply (used when coalescing sub-replies)
    pub async fn parse(mut raw: &[u8]) -> PorteroResult<RespData> {
        read_data(&mut raw).await
    }
}

/// Read one line up to `\n`, enforcing the trailing `\r\n`
///
/// Returns the line without its terminator. A clean end-of-stream before any
/// byte maps to `UnexpectedEof` so callers can tell hangup from corruption.
async fn read_line<R>(reader: &mut R) -> PorteroResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(PorteroError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed",
        )));
    }
    if line.len() < 2 || line[line.len() - 2] != b'\r' {
        return Err(PorteroError::protocol("line not terminated by CRLF"));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_len(line: &[u8]) -> PorteroResult<i64> {
    btoi::btoi::<i64>(&line[1..])
        .map_err(|_| PorteroError::protocol(format!("invalid length: {}", String::from_utf8_lossy(line))))
}

/// Read a client command: array-of-bulk-strings or inline form
pub async fn read_command<R>(reader: &mut R) -> PorteroResult<Command>
where
    R: AsyncBufRead + Unpin + Send,
{
    let line = read_line(reader).await?;
    if line.is_empty() {
        return Err(PorteroError::protocol("empty command line"));
    }

    if line[0] != T_ARRAY {
        // inline command: plain text split on whitespace
        let text = std::str::from_utf8(&line)
            .map_err(|_| PorteroError::protocol("inline command is not valid UTF-8"))?;
        let args: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        return Command::new(args);
    }

    let count = parse_len(&line)?;
    if count < 1 {
        return Err(PorteroError::protocol("command array must not be empty"));
    }
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match read_data(reader).await? {
            RespData::BulkString(Some(data)) => {
                let arg = String::from_utf8(data.to_vec())
                    .map_err(|_| PorteroError::protocol("command argument is not valid UTF-8"))?;
                args.push(arg);
            }
            other => {
                return Err(PorteroError::protocol(format!(
                    "unexpected command element: {:?}",
                    other
                )))
            }
        }
    }
    Command::new(args)
}

/// Read one fully typed RESP value
pub fn read_data<'a, R>(
    reader: &'a mut R,
) -> Pin<Box<dyn Future<Output = PorteroResult<RespData>> + Send + 'a>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Err(PorteroError::protocol("empty RESP line"));
        }
        match line[0] {
            T_SIMPLE_STRING => Ok(RespData::SimpleString(
                String::from_utf8_lossy(&line[1..]).into_owned(),
            )),
            T_ERROR => Ok(RespData::Error(
                String::from_utf8_lossy(&line[1..]).into_owned(),
            )),
            T_INTEGER => Ok(RespData::Integer(parse_len(&line)?)),
            T_BULK_STRING => {
                let len = parse_len(&line)?;
                if len == -1 {
                    return Ok(RespData::BulkString(None));
                }
                if len < 0 {
                    return Err(PorteroError::protocol("negative bulk string length"));
                }
                let mut data = vec![0u8; len as usize + 2];
                reader.read_exact(&mut data).await?;
                if &data[len as usize..] != CRLF {
                    return Err(PorteroError::protocol("bulk string not terminated by CRLF"));
                }
                data.truncate(len as usize);
                Ok(RespData::BulkString(Some(Bytes::from(data))))
            }
            T_ARRAY => {
                let len = parse_len(&line)?;
                if len == -1 {
                    return Ok(RespData::Array(None));
                }
                if len < 0 {
                    return Err(PorteroError::protocol("negative array length"));
                }
                let mut elements = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    elements.push(read_data(reader).await?);
                }
                Ok(RespData::Array(Some(elements)))
            }
            tag => Err(PorteroError::protocol(format!(
                "unknown RESP type: {}",
                tag as char
            ))),
        }
    })
}

/// Stream the raw bytes of exactly one top-level RESP value into `out`
///
/// Arrays are walked for framing only; element payloads are appended
/// verbatim, so the output is byte-identical to the wire form.
pub fn read_data_bytes<'a, R>(
    reader: &'a mut R,
    out: &'a mut BytesMut,
) -> Pin<Box<dyn Future<Output = PorteroResult<()>> + Send + 'a>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Err(PorteroError::protocol("empty RESP line"));
        }
        out.extend_from_slice(&line);
        out.extend_from_slice(CRLF);
        match line[0] {
            T_SIMPLE_STRING | T_ERROR | T_INTEGER => Ok(()),
            T_BULK_STRING => {
                let len = parse_len(&line)?;
                if len == -1 {
                    return Ok(());
                }
                if len < 0 {
                    return Err(PorteroError::protocol("negative bulk string length"));
                }
                let start = out.len();
                out.resize(start + len as usize + 2, 0);
                reader.read_exact(&mut out[start..]).await?;
                if &out[out.len() - 2..] != CRLF {
                    return Err(PorteroError::protocol("bulk string not terminated by CRLF"));
                }
                Ok(())
            }
            T_ARRAY => {
                let len = parse_len(&line)?;
                if len == -1 {
                    return Ok(());
                }
                if len < 0 {
                    return Err(PorteroError::protocol("negative array length"));
                }
                for _ in 0..len {
                    read_data_bytes(reader, out).await?;
                }
                Ok(())
            }
            tag => Err(PorteroError::protocol(format!(
                "unknown RESP type: {}",
                tag as char
            ))),
        }
    })
}
