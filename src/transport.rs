use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error};
use serde::de::DeserializeOwned;
use serde::Serialize;
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::raft::RaftHandle;
use crate::rpc::{RpcRequest, RpcResponse};
use crate::PeerId;

/// Outbound RPC client used by the consensus task. Implementations must
/// bound each call with the supplied timeout so a dead peer cannot stall
/// the replication driver.
pub trait PeerTransport: Send + Sync + 'static {
    fn call(
        &self,
        peer: PeerId,
        request: RpcRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<RpcResponse>> + Send>>;
}

/// Length-prefixed JSON over TCP, one connection per RPC.
pub struct TcpTransport;

impl PeerTransport for TcpTransport {
    fn call(
        &self,
        peer: PeerId,
        request: RpcRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<RpcResponse>> + Send>> {
        Box::pin(async move {
            tokio::time::timeout(timeout, async {
                let mut stream = TcpStream::connect(&peer).await?;
                write_frame(&mut stream, &request).await?;
                read_frame(&mut stream).await
            })
            .await
            .map_err(|_| anyhow!("rpc to {} timed out", peer))?
        })
    }
}

/// Write one `u32`-length-prefixed JSON frame.
pub async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one `u32`-length-prefixed JSON frame.
pub async fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Bind a listener with `SO_REUSEADDR` so a restarted node can retake its
/// port without waiting out TIME_WAIT.
pub fn bind_listener(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr.parse()?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Accept loop for peer RPCs: decode one request per connection, hand it
/// to the consensus task, and write its response back once the task has
/// persisted whatever the response depends on.
pub async fn serve_rpc(listener: TcpListener, handle: RaftHandle) {
    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    let request: RpcRequest = match read_frame(&mut stream).await {
                        Ok(request) => request,
                        Err(e) => {
                            debug!("dropping malformed rpc frame: {}", e);
                            return;
                        }
                    };
                    match handle.request(request).await {
                        Ok(response) => {
                            let _ = write_frame(&mut stream, &response).await;
                        }
                        Err(e) => debug!("dropping rpc reply: {}", e),
                    }
                });
            }
            Err(e) => error!("rpc accept failed: {}", e),
        }
    }
}
