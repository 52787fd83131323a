use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAGIC_BYTES: &[u8; 4] = b"MAPD";
const MAX_NAME_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub protocol_version: u32,
    pub client_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub protocol_version: u32,
    pub server_version: String,
}

impl HandshakeRequest {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            client_name: client_name.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC_BYTES);
        buf.put_u32(self.protocol_version);
        buf.put_u32(self.client_name.len() as u32);
        buf.put_slice(self.client_name.as_bytes());
        buf.to_vec()
    }

    pub async fn read_from<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        stream
            .read_exact(&mut magic)
            .await
            .context("Failed to read handshake magic")?;
        if &magic != MAGIC_BYTES {
            anyhow::bail!("Invalid magic bytes");
        }

        let protocol_version = stream.read_u32().await?;
        let client_name = read_string(stream)
            .await
            .context("Invalid client name")?;

        Ok(Self {
            protocol_version,
            client_name,
        })
    }
}

impl HandshakeResponse {
    pub fn new() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(self.protocol_version);
        buf.put_u32(self.server_version.len() as u32);
        buf.put_slice(self.server_version.as_bytes());
        buf.to_vec()
    }

    pub async fn read_from<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Self> {
        let protocol_version = stream
            .read_u32()
            .await
            .context("Failed to read handshake response")?;
        let server_version = read_string(stream)
            .await
            .context("Invalid server version")?;

        Ok(Self {
            protocol_version,
            server_version,
        })
    }
}

impl Default for HandshakeResponse {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_string<R: AsyncRead + Unpin>(stream: &mut R) -> Result<String> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_NAME_LEN {
        anyhow::bail!("String of {} bytes exceeds handshake limit", len);
    }
    let mut raw = vec![0u8; len];
    stream.read_exact(&mut raw).await?;
    Ok(String::from_utf8(raw)?)
}

pub async fn perform_handshake<S>(stream: &mut S) -> Result<HandshakeRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = HandshakeRequest::read_from(stream).await?;

    if request.protocol_version != PROTOCOL_VERSION {
        anyhow::bail!("Unsupported protocol version: {}", request.protocol_version);
    }

    stream.write_all(&HandshakeResponse::new().encode()).await?;
    stream.flush().await?;

    Ok(request)
}

pub async fn client_handshake<S>(stream: &mut S, client_name: &str) -> Result<HandshakeResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&HandshakeRequest::new(client_name).encode())
        .await?;
    stream.flush().await?;
    HandshakeResponse::read_from(stream).await
}
