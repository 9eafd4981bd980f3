//! Minimal client-side WebSocket transport (RFC 6455).
//!
//! Implements just what the gateway connection needs:
//!
//! - the HTTP/1.1 upgrade handshake with `Sec-WebSocket-Accept` validation,
//! - single-frame messages (FIN always set) with 7/16/64-bit lengths,
//! - client→server masking, server→client unmasked reads,
//! - text, close, ping and pong opcodes.
//!
//! Fragmented messages are rejected with a protocol error rather than being
//! silently truncated. Unknown opcodes are surfaced as [`WsMessage::Other`]
//! and text frames that are not UTF-8 as [`WsMessage::InvalidText`]; the
//! connection drops both and keeps reading.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;

use gatewatch_core::prelude::*;

/// GUID appended to the client key when computing `Sec-WebSocket-Accept`.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest frame payload we are willing to allocate for.
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Upper bound on response header lines during the upgrade handshake.
const MAX_HANDSHAKE_HEADER_LINES: usize = 64;

// ---------------------------------------------------------------------------
// Opcodes and messages
// ---------------------------------------------------------------------------

/// WebSocket frame opcodes used by the gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Text = 0x1,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

/// A decoded server→client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Close,
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Text frame whose payload is not UTF-8; carries the payload length.
    InvalidText(usize),
    /// Frame with an opcode we do not handle (binary, reserved).
    Other(u8),
}

/// Raw frame as read off the wire, after unmasking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl RawFrame {
    fn into_message(self) -> WsMessage {
        match self.opcode {
            0x1 => match String::from_utf8(self.payload) {
                Ok(text) => WsMessage::Text(text),
                Err(e) => WsMessage::InvalidText(e.as_bytes().len()),
            },
            0x8 => WsMessage::Close,
            0x9 => WsMessage::Ping(self.payload),
            0xA => WsMessage::Pong(self.payload),
            other => WsMessage::Other(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame encoding
// ---------------------------------------------------------------------------

/// Encode a single final frame.
///
/// With `mask = Some(key)` the payload is XORed with `key` and the mask bit
/// is set, as required for every client→server frame.
pub fn encode_frame(opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 14);

    out.push(0x80 | (opcode & 0x0F));

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Read one frame from `reader`.
///
/// Masked frames are unmasked. A frame without the FIN bit is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<RawFrame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let fin = header[0] & 0x80 != 0;
    let opcode = header[0] & 0x0F;
    let masked = header[1] & 0x80 != 0;

    let len = match header[1] & 0x7F {
        126 => u64::from(reader.read_u16().await?),
        127 => reader.read_u64().await?,
        n => u64::from(n),
    };

    if !fin {
        return Err(Error::protocol(format!(
            "fragmented WebSocket frames are not supported (opcode {opcode:#x})"
        )));
    }
    if len > MAX_FRAME_PAYLOAD {
        return Err(Error::protocol(format!(
            "WebSocket frame of {len} bytes exceeds limit of {MAX_FRAME_PAYLOAD}"
        )));
    }

    let mask = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    if let Some(key) = mask {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }

    Ok(RawFrame { opcode, payload })
}

// ---------------------------------------------------------------------------
// Reader / Writer halves
// ---------------------------------------------------------------------------

/// Read half of an established WebSocket connection.
pub struct WsReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> WsReader<R> {
    /// Wrap a raw byte stream positioned at the first frame.
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    fn from_buffered(inner: BufReader<R>) -> Self {
        Self { inner }
    }

    /// Read the next message.
    pub async fn next_message(&mut self) -> Result<WsMessage> {
        Ok(read_frame(&mut self.inner).await?.into_message())
    }
}

/// Write half of an established WebSocket connection. Every frame is masked.
pub struct WsWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> WsWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one masked frame with a fresh random mask key.
    pub async fn send(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mask: [u8; 4] = rand::random();
        let bytes = encode_frame(opcode as u8, payload, Some(mask));
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(Opcode::Text, text.as_bytes()).await
    }

    pub async fn send_ping(&mut self, payload: &[u8]) -> Result<()> {
        self.send(Opcode::Ping, payload).await
    }

    pub async fn send_pong(&mut self, payload: &[u8]) -> Result<()> {
        self.send(Opcode::Pong, payload).await
    }

    /// Send a Close frame and shut down the write side, ignoring errors.
    pub async fn close(&mut self) {
        let _ = self.send(Opcode::Close, &[]).await;
        let _ = self.inner.shutdown().await;
    }

    /// Erase the concrete stream type.
    pub fn boxed(self) -> WsWriter<Box<dyn AsyncWrite + Send + Unpin>>
    where
        W: Send + 'static,
    {
        WsWriter::new(Box::new(self.inner))
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Generate a random base64 `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Compute the `Sec-WebSocket-Accept` value expected for `key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Perform the client upgrade handshake over an already-open stream.
///
/// `host` is sent verbatim in the `Host` header. Only a `101` response with a
/// matching `Sec-WebSocket-Accept` header is accepted.
pub async fn client_handshake<S>(
    stream: S,
    host: &str,
    path: &str,
) -> Result<(WsReader<ReadHalf<S>>, WsWriter<WriteHalf<S>>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);

    let key = generate_key();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    );
    write_half.write_all(request.as_bytes()).await?;
    write_half.flush().await?;

    let mut reader = BufReader::new(read_half);

    let mut status_line = String::new();
    if reader.read_line(&mut status_line).await? == 0 {
        return Err(Error::handshake("connection closed before status line"));
    }
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "101" {
        return Err(Error::handshake(format!(
            "unexpected status line: {}",
            status_line.trim_end()
        )));
    }

    let mut accept = None;
    let mut terminated = false;
    for _ in 0..MAX_HANDSHAKE_HEADER_LINES {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::handshake("connection closed during headers"));
        }
        let line = line.trim_end();
        if line.is_empty() {
            terminated = true;
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("sec-websocket-accept") {
                accept = Some(value.trim().to_string());
            }
        }
    }
    if !terminated {
        return Err(Error::handshake("too many response headers"));
    }

    let expected = accept_key(&key);
    match accept {
        Some(value) if value == expected => {}
        Some(value) => {
            return Err(Error::handshake(format!(
                "Sec-WebSocket-Accept mismatch: expected {expected}, got {value}"
            )))
        }
        None => return Err(Error::handshake("missing Sec-WebSocket-Accept header")),
    }

    Ok((WsReader::from_buffered(reader), WsWriter::new(write_half)))
}

/// Dial `host:port` over TCP and upgrade to WebSocket at `path`.
pub async fn connect(
    host: &str,
    port: u16,
    path: &str,
) -> Result<(
    WsReader<ReadHalf<TcpStream>>,
    WsWriter<WriteHalf<TcpStream>>,
)> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::transport(format!("dial {host}:{port}: {e}")))?;
    let _ = stream.set_nodelay(true);
    client_handshake(stream, &format!("{host}:{port}"), path).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
