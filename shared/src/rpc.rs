//! RPC wire protocol and connection abstraction.
//!
//! Requests and responses are serde enums framed as line-delimited JSON over
//! TCP: one JSON document, one `\n`, one logical call per connection use on a
//! pooled connection. `null` is allowed in both directions. Every exchange is
//! bounded by a fixed per-call timeout.

use crate::command::{CallBatch, CommandResults};
use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Registration handshake; must precede any other call from a slave.
    Register {
        node_id: u64,
        rpc_port: u16,
        addresses: Vec<Ipv4Addr>,
    },
    /// Explicit goodbye.
    Unregister { node_id: u64 },
    /// An ordered command batch from the identified sender.
    Commands { node_id: u64, batch: CallBatch },
    /// Keep-alive probe.
    Ping { node_id: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    /// Registration verdict.
    Accepted(bool),
    /// Per-command results of a batch, or `None` when execution failed
    /// before producing any.
    Results(Option<CommandResults>),
    /// Keep-alive answer.
    Pong,
    /// The remote could not interpret the request.
    Error(String),
}

/// Pooled request/response connection to one remote endpoint.
///
/// The stream stays open across calls; any transport error invalidates it
/// and the owner is expected to drop it.
pub struct RpcConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    remote: Ipv4Addr,
}

impl RpcConnection {
    pub async fn connect(
        remote: Ipv4Addr,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let addr = SocketAddr::from((remote, port));
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MeshError::Timeout)??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            remote,
        })
    }

    /// Address this connection was opened against.
    pub fn remote_addr(&self) -> Ipv4Addr {
        self.remote
    }

    /// One request/response exchange under the per-call timeout.
    pub async fn call(
        &mut self,
        request: &RpcRequest,
        call_timeout: Duration,
    ) -> Result<RpcResponse> {
        let mut frame = serde_json::to_vec(request)?;
        frame.push(b'\n');

        timeout(call_timeout, async {
            self.writer.write_all(&frame).await?;
            self.writer.flush().await?;

            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(MeshError::Protocol("connection closed mid-call".into()));
            }
            let response: RpcResponse = serde_json::from_str(line.trim())?;
            Ok(response)
        })
        .await
        .map_err(|_| MeshError::Timeout)?
    }
}

/// Reads one request frame; `Ok(None)` on clean end-of-stream.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<RpcRequest>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let request: RpcRequest = serde_json::from_str(line.trim())?;
    Ok(Some(request))
}

/// Writes one response frame.
pub async fn write_response<W>(writer: &mut W, response: &RpcResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = serde_json::to_vec(response)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
