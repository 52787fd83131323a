use crate::protocol::messages::{Request, Response};
use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request = 1,
    Response = 2,
}

impl FrameKind {
    pub fn from_u8(val: u8) -> Result<Self> {
        match val {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Response),
            _ => anyhow::bail!("Unknown frame kind: {}", val),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// `[u32 length][u8 kind][payload]`, length counting the kind byte.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn request(request: &Request) -> Result<Self> {
        let payload = bincode::serialize(request).context("Failed to encode request")?;
        Ok(Self::new(FrameKind::Request, payload))
    }

    pub fn response(response: &Response) -> Result<Self> {
        let payload = bincode::serialize(response).context("Failed to encode response")?;
        Ok(Self::new(FrameKind::Response, payload))
    }

    pub fn decode_request(&self) -> Result<Request> {
        if self.kind != FrameKind::Request {
            anyhow::bail!("Expected request frame, got {:?}", self.kind);
        }
        bincode::deserialize(&self.payload).context("Failed to decode request")
    }

    pub fn decode_response(&self) -> Result<Response> {
        if self.kind != FrameKind::Response {
            anyhow::bail!("Expected response frame, got {:?}", self.kind);
        }
        bincode::deserialize(&self.payload).context("Failed to decode response")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 5);
        buf.put_u32((self.payload.len() + 1) as u32);
        buf.put_u8(self.kind.to_u8());
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Returns `None` when the peer closes the stream between frames.
    pub async fn read_from<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Option<Self>> {
        let length = match stream.read_u32().await {
            Ok(length) => length,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("Failed to read frame length"),
        };

        if length == 0 || length > MAX_FRAME_LEN {
            anyhow::bail!("Invalid frame length: {}", length);
        }

        let kind_byte = stream.read_u8().await.context("Failed to read frame kind")?;
        let kind = FrameKind::from_u8(kind_byte)?;

        let mut payload = vec![0u8; (length - 1) as usize];
        stream
            .read_exact(&mut payload)
            .await
            .context("Failed to read payload")?;

        Ok(Some(Self { kind, payload }))
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<()> {
        stream.write_all(&self.encode()).await?;
        stream.flush().await?;
        Ok(())
    }
}
