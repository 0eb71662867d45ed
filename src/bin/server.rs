use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, error, info};
use quorum_log::raft::{RaftConfig, RaftHandle, RaftNode};
use quorum_log::rpc::{ClientRequest, ClientResponse};
use quorum_log::transport::{bind_listener, read_frame, serve_rpc, write_frame, TcpTransport};
use quorum_log::StateMachine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Clients connect on the RPC port plus this offset unless overridden.
const CLIENT_PORT_OFFSET: u16 = 1000;

#[derive(Parser)]
#[command(version, about = "Replicated log consensus node")]
struct Cli {
    /// This node's identity and RPC listen address (host:port).
    #[arg(long)]
    self_id: String,

    /// Full cluster membership, including this node.
    #[arg(long, required = true, num_args = 1..)]
    peers: Vec<String>,

    /// Client/admin listen address; defaults to the RPC port + 1000.
    #[arg(long)]
    client_addr: Option<String>,

    #[arg(long, default_value_t = 150)]
    election_timeout_min: u64,

    #[arg(long, default_value_t = 300)]
    election_timeout_max: u64,

    #[arg(long, default_value_t = 50)]
    heartbeat_interval: u64,

    #[arg(long, default_value_t = 100)]
    rpc_timeout: u64,

    /// Directory holding the persistent header and log files.
    #[arg(long)]
    storage_path: PathBuf,
}

/// Demo state machine: remembers every applied command and acknowledges
/// each one with its log position.
#[derive(Default)]
struct Ledger {
    commands: Vec<String>,
}

impl StateMachine for Ledger {
    fn apply(&mut self, index: u64, command: &str) -> String {
        self.commands.push(command.to_string());
        format!("applied:{} total:{}", index, self.commands.len())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if !cli.peers.contains(&cli.self_id) {
        bail!("--peers must include --self-id ({})", cli.self_id);
    }

    let config = RaftConfig {
        self_id: cli.self_id.clone(),
        peers: cli.peers.clone(),
        election_timeout_min: cli.election_timeout_min,
        election_timeout_max: cli.election_timeout_max,
        heartbeat_interval: cli.heartbeat_interval,
        rpc_timeout: cli.rpc_timeout,
        storage_path: cli.storage_path.clone(),
    };

    let (handle, join) =
        RaftNode::spawn(config, Box::new(Ledger::default()), Arc::new(TcpTransport))?;

    let rpc_listener = bind_listener(&cli.self_id)
        .with_context(|| format!("binding rpc listener on {}", cli.self_id))?;
    tokio::spawn(serve_rpc(rpc_listener, handle.clone()));

    let client_addr = match cli.client_addr {
        Some(addr) => addr,
        None => offset_addr(&cli.self_id, CLIENT_PORT_OFFSET)?,
    };
    let client_listener = bind_listener(&client_addr)
        .with_context(|| format!("binding client listener on {}", client_addr))?;
    tokio::spawn(serve_clients(client_listener, handle.clone()));

    info!(
        "node {} up: rpc on {}, clients on {}",
        cli.self_id, cli.self_id, client_addr
    );

    match join.await {
        Ok(result) => result,
        Err(e) => {
            error!("consensus task panicked: {}", e);
            Err(e.into())
        }
    }
}

/// Shift the port of a `host:port` address.
fn offset_addr(addr: &str, offset: u16) -> Result<String> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("address {} is not host:port", addr))?;
    let port: u16 = port.parse()?;
    Ok(format!("{}:{}", host, port + offset))
}

/// Accept loop for client submissions and status queries.
async fn serve_clients(listener: TcpListener, handle: RaftHandle) {
    loop {
        match listener.accept().await {
            Ok((mut stream, addr)) => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    let request: ClientRequest = match read_frame(&mut stream).await {
                        Ok(request) => request,
                        Err(e) => {
                            debug!("dropping malformed client frame from {}: {}", addr, e);
                            return;
                        }
                    };
                    let response = match request {
                        ClientRequest::Submit { command } => {
                            match handle.submit(command).await {
                                Ok(response) => response,
                                Err(e) => ClientResponse::Error {
                                    error: e.to_string(),
                                },
                            }
                        }
                        ClientRequest::Status => match handle.status().await {
                            Ok(status) => ClientResponse::Status(status),
                            Err(e) => ClientResponse::Error {
                                error: e.to_string(),
                            },
                        },
                    };
                    let _ = write_frame(&mut stream, &response).await;
                });
            }
            Err(e) => error!("client accept failed: {}", e),
        }
    }
}
