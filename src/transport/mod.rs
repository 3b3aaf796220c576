//! Transport Module
//!
//! Request/response messaging between cluster members, over TCP or
//! in-process for tests and embedded clusters.

mod local;
mod protocol;
mod server;
mod tcp;

pub use local::{CallStats, LocalTransport};
pub use protocol::{FrameHeader, NackReason, NodeStatus, Request, Response};
pub use server::TcpServer;
pub use tcp::TcpTransport;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Member id
    pub id: String,
    /// Network address (`host:port`)
    pub address: String,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Client side of the transport
///
/// Connection loss surfaces as [`Error::ConnectionFailed`],
/// [`Error::ConnectionTimeout`], [`Error::Network`] or [`Error::Io`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, endpoint: &Endpoint, request: Request) -> Result<Response>;
}

/// Server side of the transport
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// Read a framed request from a reader
pub async fn read_request<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Request> {
    let body = read_frame(reader).await?;
    Ok(Request::deserialize(&body)?)
}

/// Read a framed response from a reader
pub async fn read_response<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Response> {
    let body = read_frame(reader).await?;
    Ok(Response::deserialize(&body)?)
}

/// Write a framed request to a writer
pub async fn write_request<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    request: &Request,
) -> Result<()> {
    write_frame(writer, &request.serialize()?).await
}

/// Write a framed response to a writer
pub async fn write_response<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<()> {
    write_frame(writer, &response.serialize()?).await
}

async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);
    if header.length > FrameHeader::MAX_FRAME_SIZE {
        return Err(Error::Network(format!(
            "frame too large ({} bytes, limit {})",
            header.length,
            FrameHeader::MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }
    Ok(body)
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    if body.len() > FrameHeader::MAX_FRAME_SIZE as usize {
        return Err(Error::Network(format!(
            "frame too large ({} bytes, limit {})",
            body.len(),
            FrameHeader::MAX_FRAME_SIZE
        )));
    }

    let header = FrameHeader::new(body);
    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
