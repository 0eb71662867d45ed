use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::PeerId;

/// Consensus RPCs exchanged between peers. Decoded from the wire at the
/// transport edge; the consensus task only ever sees these variants.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RpcRequest {
    RequestVote {
        term: u64,
        candidate_id: PeerId,
        last_log_index: u64,
        last_log_term: u64,
    },
    AppendEntries {
        term: u64,
        leader_id: PeerId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RpcResponse {
    RequestVote { term: u64, vote_granted: bool },
    AppendEntries { term: u64, success: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Read-only view of a node's consensus state, served to diagnostics
/// clients. Never consulted by the protocol itself.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatusSnapshot {
    pub current_term: u64,
    pub role: Role,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub voted_for: Option<PeerId>,
    pub leader_id: Option<PeerId>,
}

/// Requests accepted on the client endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ClientRequest {
    Submit { command: String },
    Status,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ClientResponse {
    /// The command was committed and applied; `result` is whatever the
    /// state machine returned for it.
    Committed { result: String },
    /// This node is not the leader but knows who is.
    Redirect { leader_id: PeerId },
    Error { error: String },
    Status(StatusSnapshot),
}
