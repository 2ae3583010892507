//! RESP framing used by the geospatial index: commands go out as arrays of
//! bulk strings, replies come back as any RESP type.

use futures::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::store::command::Command;
use crate::store::StoreError;

/// Upper bound on a single bulk payload accepted from the store.
pub const MAX_BULK_LEN: i64 = 64 * 1024 * 1024;
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Extracts the payload of a single-value reply. Error replies become
    /// `StoreError::Server`.
    pub fn into_body(self) -> Result<Vec<u8>, StoreError> {
        match self {
            Reply::Simple(text) => Ok(text.into_bytes()),
            Reply::Bulk(Some(bytes)) => Ok(bytes),
            Reply::Error(message) => Err(StoreError::Server(message)),
            Reply::Bulk(None) => Err(StoreError::Protocol("unexpected nil reply".to_string())),
            Reply::Integer(value) => Err(StoreError::Protocol(format!(
                "unexpected integer reply {value}"
            ))),
            Reply::Array(_) => Err(StoreError::Protocol("unexpected array reply".to_string())),
        }
    }
}

pub fn encode(command: &Command) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    let total = command.args().len() + 1;
    out.extend_from_slice(format!("*{total}\r\n").as_bytes());
    write_bulk(&mut out, command.name().as_bytes());
    for arg in command.args() {
        write_bulk(&mut out, arg.as_bytes());
    }
    out
}

fn write_bulk(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(format!("${}\r\n", value.len()).as_bytes());
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

pub fn read_reply<'a, R>(reader: &'a mut R) -> BoxFuture<'a, Result<Reply, StoreError>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        let line = read_line(reader).await?;
        let (kind, rest) = line.split_at(1);

        match kind {
            "+" => Ok(Reply::Simple(rest.to_string())),
            "-" => Ok(Reply::Error(rest.to_string())),
            ":" => parse_len(rest).map(Reply::Integer),
            "$" => {
                let len = parse_len(rest)?;
                if len < 0 {
                    return Ok(Reply::Bulk(None));
                }
                if len > MAX_BULK_LEN {
                    return Err(StoreError::Protocol(format!(
                        "bulk reply of {len} bytes exceeds {MAX_BULK_LEN}"
                    )));
                }
                let mut payload = vec![0u8; len as usize + 2];
                reader.read_exact(&mut payload).await?;
                if !payload.ends_with(b"\r\n") {
                    return Err(StoreError::Protocol(
                        "bulk reply not terminated".to_string(),
                    ));
                }
                payload.truncate(len as usize);
                Ok(Reply::Bulk(Some(payload)))
            }
            "*" => {
                let len = parse_len(rest)?;
                if len < 0 {
                    return Ok(Reply::Array(None));
                }
                if len > MAX_ARRAY_LEN {
                    return Err(StoreError::Protocol(format!(
                        "array reply of {len} items exceeds {MAX_ARRAY_LEN}"
                    )));
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(read_reply(reader).await?);
                }
                Ok(Reply::Array(Some(items)))
            }
            other => Err(StoreError::Protocol(format!(
                "unknown reply type {other:?}"
            ))),
        }
    })
}

async fn read_line<R>(reader: &mut R) -> Result<String, StoreError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = reader.read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Err(StoreError::Protocol("connection closed by store".to_string()));
    }
    if buf.len() < 3 || !buf.ends_with(b"\r\n") {
        return Err(StoreError::Protocol("malformed reply line".to_string()));
    }
    buf.truncate(buf.len() - 2);

    String::from_utf8(buf).map_err(|err| StoreError::Protocol(format!("reply line is not utf8: {err}")))
}

fn parse_len(raw: &str) -> Result<i64, StoreError> {
    raw.parse::<i64>()
        .map_err(|err| StoreError::Protocol(format!("invalid length {raw:?}: {err}")))
}
