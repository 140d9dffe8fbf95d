use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PgWireError, Result};

/// Largest message the server may legally send (PostgreSQL's `MaxAllocSize`).
pub const MAX_MESSAGE_LEN: usize = 0x3fff_ffff;

#[derive(Debug, Clone)]
pub struct BackendMessage {
    pub tag: u8,
    pub payload: Bytes, // payload excludes the 4-byte length field
}

/// Incremental reader for tagged protocol messages.
///
/// Bytes are accumulated in an internal buffer, so [`MessageReader::read`]
/// is cancel-safe: dropping the future (e.g. when another `select!` branch
/// wins) never loses a partially received message. The same buffer travels
/// with the connection from the handshake into the streaming worker.
#[derive(Debug)]
pub struct MessageReader {
    buf: BytesMut,
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
        }
    }

    /// Number of bytes received but not yet returned as a message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Split one complete message off the buffer, if there is one.
    pub fn try_decode(&mut self) -> Result<Option<BackendMessage>> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let tag = self.buf[0];
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len < 4 || len as usize > MAX_MESSAGE_LEN {
            return Err(PgWireError::Protocol(format!(
                "invalid message length {len} for tag 0x{tag:02x}"
            )));
        }
        let total = 1 + len as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total);
        frame.advance(5);
        Ok(Some(BackendMessage {
            tag,
            payload: frame.freeze(),
        }))
    }

    /// Read the next message, waiting for more bytes as needed.
    ///
    /// End of stream is reported as an I/O error: the server never closes a
    /// connection between messages without telling us first.
    pub async fn read<R: AsyncRead + Unpin>(&mut self, rd: &mut R) -> Result<BackendMessage> {
        loop {
            if let Some(msg) = self.try_decode()? {
                return Ok(msg);
            }
            let n = rd.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(PgWireError::Io(if self.buf.is_empty() {
                    "connection closed by server".into()
                } else {
                    format!(
                        "connection closed by server mid-message ({} bytes buffered)",
                        self.buf.len()
                    )
                }));
            }
        }
    }
}

fn put_message(buf: &mut BytesMut, tag: u8, payload: &[u8]) {
    buf.reserve(payload.len() + 5);
    buf.put_u8(tag);
    buf.put_i32((payload.len() + 4) as i32);
    buf.extend_from_slice(payload);
}

pub async fn write_query<W: AsyncWrite + Unpin>(wr: &mut W, sql: &str) -> Result<()> {
    let mut body = Vec::with_capacity(sql.len() + 1);
    body.extend_from_slice(sql.as_bytes());
    body.push(0);

    let mut buf = BytesMut::new();
    put_message(&mut buf, b'Q', &body);

    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}

pub async fn write_copy_data<W: AsyncWrite + Unpin>(wr: &mut W, payload: &[u8]) -> Result<()> {
    let mut buf = BytesMut::new();
    put_message(&mut buf, b'd', payload);

    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}

pub async fn write_copy_done<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    let mut buf = BytesMut::with_capacity(5);
    put_message(&mut buf, b'c', &[]); // CopyDone has no payload
    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}
