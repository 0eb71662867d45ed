//! A replicated log for a small fixed cluster of peers, driven by a
//! leader-based consensus protocol in the Raft family. Each node runs a
//! single consensus task that owns all protocol state; peers talk to it
//! over length-prefixed JSON frames, clients submit opaque commands that
//! are applied to a user [`StateMachine`] once committed on a quorum.

pub mod log;
pub mod raft;
pub mod rpc;
pub mod storage;
pub mod transport;

/// Stable node identity; the `host:port` its RPC endpoint listens on.
pub type PeerId = String;

/// The user state machine that committed commands are applied to, in log
/// order, exactly once per node. The returned string is routed back to
/// the submitting client on the leader and discarded elsewhere.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, index: u64, command: &str) -> String;
}

pub use crate::log::{Log, LogEntry};
pub use crate::raft::{RaftConfig, RaftHandle, RaftNode};
pub use crate::rpc::{
    ClientRequest, ClientResponse, Role, RpcRequest, RpcResponse, StatusSnapshot,
};
pub use crate::transport::{bind_listener, PeerTransport, TcpTransport};
