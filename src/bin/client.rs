use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quorum_log::rpc::{ClientRequest, ClientResponse};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: usize = 10;

#[derive(Parser)]
#[command(version, about = "Client for the replicated log cluster")]
struct Cli {
    /// Client endpoints of the cluster members.
    #[arg(long, required = true, num_args = 1..)]
    servers: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a command for replication, following leader redirects.
    Submit { command: String },
    /// Print every node's status snapshot.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Submit { command } => submit(&cli.servers, command),
        Commands::Status => status(&cli.servers),
    }
}

/// Try each server in turn until one accepts the command, chasing
/// redirects toward whichever node currently leads.
fn submit(servers: &[String], command: String) -> Result<()> {
    let mut targets: Vec<String> = servers.to_vec();
    for attempt in 1..=MAX_ATTEMPTS {
        for addr in targets.clone() {
            let request = ClientRequest::Submit {
                command: command.clone(),
            };
            match call(&addr, &request) {
                Ok(ClientResponse::Committed { result }) => {
                    println!("committed via {}: {}", addr, result);
                    return Ok(());
                }
                Ok(ClientResponse::Redirect { leader_id }) => {
                    println!("{} redirects to leader {}", addr, leader_id);
                    // The redirect names the leader's RPC endpoint; its
                    // client endpoint sits at the conventional offset.
                    if let Ok(leader_addr) = offset_addr(&leader_id, 1000) {
                        targets = vec![leader_addr];
                    }
                    break;
                }
                Ok(ClientResponse::Error { error }) => {
                    println!("{}: {}", addr, error);
                }
                Ok(other) => println!("{}: unexpected response {:?}", addr, other),
                Err(e) => println!("{}: unreachable ({})", addr, e),
            }
        }
        println!("attempt {} of {} failed, retrying", attempt, MAX_ATTEMPTS);
        std::thread::sleep(Duration::from_millis(500));
        if targets.len() == 1 && !servers.contains(&targets[0]) {
            // Keep the redirect target but fall back to the full list too.
            targets.extend(servers.iter().cloned());
        }
    }
    bail!("no server accepted the command after {} attempts", MAX_ATTEMPTS);
}

/// Poll every node's diagnostics snapshot.
fn status(servers: &[String]) -> Result<()> {
    for addr in servers {
        match call(addr, &ClientRequest::Status) {
            Ok(ClientResponse::Status(status)) => {
                println!("{} - {}", addr, serde_json::to_string(&status)?);
            }
            Ok(other) => println!("{} - unexpected response {:?}", addr, other),
            Err(e) => println!("{} - unreachable ({})", addr, e),
        }
    }
    Ok(())
}

/// One length-prefixed JSON request/response exchange.
fn call(addr: &str, request: &ClientRequest) -> Result<ClientResponse> {
    let sockaddr = addr
        .parse()
        .with_context(|| format!("address {} is not host:port", addr))?;
    let mut stream = TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(REPLY_TIMEOUT))?;

    let bytes = serde_json::to_vec(request)?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

fn offset_addr(addr: &str, offset: u16) -> Result<String> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("address {} is not host:port", addr))?;
    let port: u16 = port.parse()?;
    Ok(format!("{}:{}", host, port + offset))
}
