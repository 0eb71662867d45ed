use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error, info};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::log::{Log, LogEntry};
use crate::rpc::{ClientResponse, Role, RpcRequest, RpcResponse, StatusSnapshot};
use crate::storage::Storage;
use crate::transport::PeerTransport;
use crate::{PeerId, StateMachine};

#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's identity, which doubles as its RPC listen address.
    pub self_id: PeerId,
    /// Full cluster membership, including `self_id`.
    pub peers: Vec<PeerId>,
    pub election_timeout_min: u64, // milliseconds
    pub election_timeout_max: u64, // milliseconds
    pub heartbeat_interval: u64,   // milliseconds
    pub rpc_timeout: u64,          // milliseconds
    pub storage_path: PathBuf,
}

impl RaftConfig {
    pub fn new(self_id: PeerId, peers: Vec<PeerId>, storage_path: PathBuf) -> Self {
        Self {
            self_id,
            peers,
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            storage_path,
        }
    }

    pub fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    fn others(&self) -> impl Iterator<Item = &PeerId> + '_ {
        self.peers.iter().filter(move |p| **p != self.self_id)
    }

    fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng()
            .gen_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(ms)
    }
}

/// Everything the consensus task reacts to. The task consumes these
/// serially; consumption order is the order of state transitions.
enum Message {
    /// An inbound peer RPC; the response travels back over the channel
    /// only after any state change justifying it has been persisted.
    Request(RpcRequest, oneshot::Sender<RpcResponse>),
    /// A response to an RPC we sent earlier, tagged with the snapshot the
    /// request was built from.
    Response {
        peer: PeerId,
        sent: SentRpc,
        response: RpcResponse,
    },
    Submit(String, oneshot::Sender<ClientResponse>),
    Status(oneshot::Sender<StatusSnapshot>),
    ElectionTick,
    HeartbeatTick,
    Shutdown,
}

/// What an outbound RPC was built from. Echoed back with its response so
/// replies that no longer correspond to current state can be discarded.
#[derive(Debug, Clone, Copy)]
enum SentRpc {
    Vote {
        term: u64,
    },
    Append {
        term: u64,
        prev_log_index: u64,
        sent_entries: u64,
    },
}

/// Cheap cloneable handle for talking to the consensus task.
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl RaftHandle {
    /// Deliver an inbound peer RPC and wait for its response.
    pub async fn request(&self, request: RpcRequest) -> Result<RpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Message::Request(request, tx))
            .map_err(|_| anyhow!("consensus task stopped"))?;
        rx.await.map_err(|_| anyhow!("consensus task stopped"))
    }

    /// Submit a command for replication. Resolves once the command is
    /// committed and applied, or with a redirect/error.
    pub async fn submit(&self, command: String) -> Result<ClientResponse> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Message::Submit(command, tx))
            .map_err(|_| anyhow!("consensus task stopped"))?;
        rx.await.map_err(|_| anyhow!("consensus task stopped"))
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Message::Status(tx))
            .map_err(|_| anyhow!("consensus task stopped"))?;
        rx.await.map_err(|_| anyhow!("consensus task stopped"))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown);
    }
}

/// A single consensus node. All persistent and volatile state is owned by
/// one task; timers, inbound RPCs, and RPC responses all funnel through
/// the same message queue.
pub struct RaftNode {
    config: RaftConfig,
    transport: Arc<dyn PeerTransport>,
    state_machine: Box<dyn StateMachine>,
    storage: Storage,

    // Persistent state, mirrored on disk through `storage` before any
    // response that depends on it is sent.
    current_term: u64,
    voted_for: Option<PeerId>,
    log: Log,

    // Volatile state.
    role: Role,
    leader_id: Option<PeerId>,
    commit_index: u64,
    last_applied: u64,
    votes_received: HashSet<PeerId>,
    next_index: HashMap<PeerId, u64>,
    match_index: HashMap<PeerId, u64>,
    election_deadline: Instant,

    /// Client submissions waiting for their log index to be applied.
    pending: HashMap<u64, oneshot::Sender<ClientResponse>>,

    rx: mpsc::UnboundedReceiver<Message>,
    tx: mpsc::UnboundedSender<Message>,
}

impl RaftNode {
    /// Recover persistent state from disk and start the consensus task.
    /// The task runs until `RaftHandle::shutdown` or a persistence failure.
    pub fn spawn(
        config: RaftConfig,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<(RaftHandle, JoinHandle<Result<()>>)> {
        let (storage, recovered) = Storage::open(&config.storage_path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let election_deadline = Instant::now() + config.random_election_timeout();

        info!(
            "[{}] starting: term={} voted_for={:?} log_len={}",
            config.self_id,
            recovered.current_term,
            recovered.voted_for,
            recovered.entries.len()
        );

        let mut node = RaftNode {
            transport,
            state_machine,
            storage,
            current_term: recovered.current_term,
            voted_for: recovered.voted_for,
            log: Log::from_entries(recovered.entries),
            role: Role::Follower,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline,
            pending: HashMap::new(),
            rx,
            tx: tx.clone(),
            config,
        };

        let handle = RaftHandle { tx };
        let join = tokio::spawn(async move {
            let result = node.run().await;
            if let Err(e) = &result {
                error!("[{}] consensus task halted: {:#}", node.config.self_id, e);
            }
            result
        });
        Ok((handle, join))
    }

    async fn run(&mut self) -> Result<()> {
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let message = tokio::select! {
                _ = tokio::time::sleep_until(self.election_deadline),
                    if self.role != Role::Leader => Message::ElectionTick,
                _ = heartbeat.tick(), if self.role == Role::Leader => Message::HeartbeatTick,
                maybe = self.rx.recv() => match maybe {
                    Some(message) => message,
                    None => Message::Shutdown,
                },
            };

            match message {
                Message::Request(request, reply) => {
                    let response = self.handle_request(request)?;
                    let _ = reply.send(response);
                }
                Message::Response {
                    peer,
                    sent,
                    response,
                } => self.handle_response(peer, sent, response)?,
                Message::Submit(command, reply) => self.handle_submit(command, reply)?,
                Message::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                Message::ElectionTick => self.start_election()?,
                Message::HeartbeatTick => self.broadcast_append_entries(),
                Message::Shutdown => {
                    info!("[{}] shutting down", self.config.self_id);
                    self.drain_pending("shutting_down");
                    return Ok(());
                }
            }
        }
    }

    fn handle_request(&mut self, request: RpcRequest) -> Result<RpcResponse> {
        match request {
            RpcRequest::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => self.handle_request_vote(term, candidate_id, last_log_index, last_log_term),
            RpcRequest::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
        }
    }

    /// Any RPC (request or response) carrying a newer term forces a step
    /// down before the RPC itself is processed.
    fn observe_term(&mut self, term: u64) -> Result<()> {
        if term > self.current_term {
            info!(
                "[{}] observed term {} > {}, stepping down",
                self.config.self_id, term, self.current_term
            );
            self.current_term = term;
            self.voted_for = None;
            self.storage.save_header(self.current_term, &self.voted_for)?;
            self.become_follower();
        }
        Ok(())
    }

    fn handle_request_vote(
        &mut self,
        term: u64,
        candidate_id: PeerId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<RpcResponse> {
        self.observe_term(term)?;

        let mut vote_granted = false;
        if term == self.current_term
            && (self.voted_for.is_none() || self.voted_for.as_ref() == Some(&candidate_id))
        {
            let up_to_date = last_log_term > self.log.last_term()
                || (last_log_term == self.log.last_term()
                    && last_log_index >= self.log.last_index());
            if up_to_date {
                self.voted_for = Some(candidate_id.clone());
                self.storage.save_header(self.current_term, &self.voted_for)?;
                self.reset_election_deadline();
                info!(
                    "[{}] granted vote to {} for term {}",
                    self.config.self_id, candidate_id, term
                );
                vote_granted = true;
            } else {
                debug!(
                    "[{}] denied vote to {}: log not up to date",
                    self.config.self_id, candidate_id
                );
            }
        }

        Ok(RpcResponse::RequestVote {
            term: self.current_term,
            vote_granted,
        })
    }

    fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: PeerId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<RpcResponse> {
        if term < self.current_term {
            return Ok(RpcResponse::AppendEntries {
                term: self.current_term,
                success: false,
            });
        }
        self.observe_term(term)?;

        // A current-term AppendEntries always comes from the one leader of
        // that term.
        if self.role != Role::Follower {
            self.become_follower();
        }
        self.leader_id = Some(leader_id);
        self.reset_election_deadline();

        if !self.log.matches_at(prev_log_index, prev_log_term) {
            debug!(
                "[{}] append rejected: no entry matching index {} term {} (log ends at {})",
                self.config.self_id,
                prev_log_index,
                prev_log_term,
                self.log.last_index()
            );
            return Ok(RpcResponse::AppendEntries {
                term: self.current_term,
                success: false,
            });
        }

        // Skip entries we already hold; on the first conflict, drop the
        // conflicting suffix; append whatever remains.
        let mut keep = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            let index = prev_log_index + 1 + i as u64;
            match self.log.at(index) {
                Some(existing) if existing.term == entry.term => keep += 1,
                Some(existing) => {
                    debug!(
                        "[{}] conflict at index {}: term {} != {}, truncating",
                        self.config.self_id, index, existing.term, entry.term
                    );
                    self.log.truncate_suffix_from(index);
                    self.storage.truncate_from(index)?;
                    break;
                }
                None => break,
            }
        }
        if keep < entries.len() {
            let new_entries = &entries[keep..];
            self.log.append(new_entries);
            self.storage.append_entries(new_entries)?;
            debug!(
                "[{}] appended {} entries, log now ends at {}",
                self.config.self_id,
                new_entries.len(),
                self.log.last_index()
            );
        }

        if leader_commit > self.commit_index {
            self.commit_index = leader_commit.min(self.log.last_index());
            self.apply_committed();
        }

        Ok(RpcResponse::AppendEntries {
            term: self.current_term,
            success: true,
        })
    }

    fn handle_response(&mut self, peer: PeerId, sent: SentRpc, response: RpcResponse) -> Result<()> {
        match (sent, response) {
            (SentRpc::Vote { term }, RpcResponse::RequestVote { term: resp_term, vote_granted }) => {
                self.observe_term(resp_term)?;
                if self.role != Role::Candidate || term != self.current_term {
                    return Ok(());
                }
                if vote_granted {
                    self.votes_received.insert(peer);
                    if self.votes_received.len() >= self.config.quorum() {
                        self.become_leader();
                    }
                }
            }
            (
                SentRpc::Append {
                    term,
                    prev_log_index,
                    sent_entries,
                },
                RpcResponse::AppendEntries {
                    term: resp_term,
                    success,
                },
            ) => {
                self.observe_term(resp_term)?;
                if self.role != Role::Leader || term != self.current_term {
                    return Ok(());
                }
                if success {
                    let acked = prev_log_index + sent_entries;
                    let matched = self.match_index.entry(peer.clone()).or_insert(0);
                    *matched = (*matched).max(acked);
                    let next = (acked + 1).max(self.next_index.get(&peer).copied().unwrap_or(1));
                    self.next_index.insert(peer.clone(), next);
                    self.advance_commit_index();
                    // Keep pushing until the follower is caught up.
                    if self.role == Role::Leader && self.log.last_index() >= next {
                        self.send_append_entries(&peer);
                    }
                } else {
                    // Back off one step, but only if this reply corresponds
                    // to the probe we would currently send.
                    let next = self.next_index.entry(peer.clone()).or_insert(1);
                    if *next == prev_log_index + 1 && *next > 1 {
                        *next -= 1;
                        debug!(
                            "[{}] backing off next_index[{}] to {}",
                            self.config.self_id, peer, *next
                        );
                    }
                }
            }
            (sent, response) => {
                debug!(
                    "[{}] mismatched response from {}: sent {:?}, got {:?}",
                    self.config.self_id, peer, sent, response
                );
            }
        }
        Ok(())
    }

    fn handle_submit(
        &mut self,
        command: String,
        reply: oneshot::Sender<ClientResponse>,
    ) -> Result<()> {
        if self.role != Role::Leader {
            let response = match &self.leader_id {
                Some(leader) => ClientResponse::Redirect {
                    leader_id: leader.clone(),
                },
                None => ClientResponse::Error {
                    error: "no_leader".to_string(),
                },
            };
            let _ = reply.send(response);
            return Ok(());
        }

        let entries = [LogEntry {
            term: self.current_term,
            command,
        }];
        let index = self.log.append(&entries);
        self.storage.append_entries(&entries)?;
        self.pending.insert(index, reply);
        debug!(
            "[{}] accepted command at index {} term {}",
            self.config.self_id, index, self.current_term
        );

        // A single-node cluster commits on its own; everyone else needs
        // follower acknowledgements first.
        self.advance_commit_index();
        self.broadcast_append_entries();
        Ok(())
    }

    fn start_election(&mut self) -> Result<()> {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.config.self_id.clone());
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.config.self_id.clone());
        self.storage.save_header(self.current_term, &self.voted_for)?;
        self.reset_election_deadline();
        info!(
            "[{}] starting election for term {}",
            self.config.self_id, self.current_term
        );

        if self.votes_received.len() >= self.config.quorum() {
            self.become_leader();
            return Ok(());
        }

        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        for peer in self.config.others() {
            self.dispatch(
                peer.clone(),
                SentRpc::Vote {
                    term: self.current_term,
                },
                RpcRequest::RequestVote {
                    term: self.current_term,
                    candidate_id: self.config.self_id.clone(),
                    last_log_index,
                    last_log_term,
                },
            );
        }
        Ok(())
    }

    fn become_leader(&mut self) {
        info!(
            "[{}] became leader for term {}",
            self.config.self_id, self.current_term
        );
        self.role = Role::Leader;
        self.leader_id = Some(self.config.self_id.clone());
        self.reset_election_deadline();
        let next = self.log.last_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.config.others() {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer.clone(), 0);
        }
        self.broadcast_append_entries();
    }

    fn become_follower(&mut self) {
        if self.role == Role::Leader {
            info!("[{}] no longer leader", self.config.self_id);
            // The deadline went stale while the election timer was parked;
            // give the new leader a full timeout to reach us.
            self.reset_election_deadline();
        }
        self.role = Role::Follower;
        self.leader_id = None;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.drain_pending("leadership_lost");
    }

    /// Fail every waiting client submission; used on step-down and
    /// shutdown, when this node can no longer promise the entry commits.
    fn drain_pending(&mut self, error: &str) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(ClientResponse::Error {
                error: error.to_string(),
            });
        }
    }

    fn broadcast_append_entries(&self) {
        for peer in self.config.others() {
            self.send_append_entries(peer);
        }
    }

    /// One AppendEntries to one peer: a heartbeat when it is caught up, a
    /// catch-up batch otherwise.
    fn send_append_entries(&self, peer: &PeerId) {
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1);
        let prev_log_index = next - 1;
        let entries = self.log.entries_from(next);
        self.dispatch(
            peer.clone(),
            SentRpc::Append {
                term: self.current_term,
                prev_log_index,
                sent_entries: entries.len() as u64,
            },
            RpcRequest::AppendEntries {
                term: self.current_term,
                leader_id: self.config.self_id.clone(),
                prev_log_index,
                prev_log_term: self.log.term_at(prev_log_index),
                entries,
                leader_commit: self.commit_index,
            },
        );
    }

    /// Fire an RPC at a peer from a spawned task; the result re-enters the
    /// message queue. Transport failures are logged and dropped, the driver
    /// retries on a later tick.
    fn dispatch(&self, peer: PeerId, sent: SentRpc, request: RpcRequest) {
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        let timeout = Duration::from_millis(self.config.rpc_timeout);
        let self_id = self.config.self_id.clone();
        tokio::spawn(async move {
            match transport.call(peer.clone(), request, timeout).await {
                Ok(response) => {
                    let _ = tx.send(Message::Response {
                        peer,
                        sent,
                        response,
                    });
                }
                Err(e) => debug!("[{}] rpc to {} failed: {}", self_id, peer, e),
            }
        });
    }

    /// Advance `commit_index` to the highest N replicated on a quorum
    /// (counting ourselves), but only if log[N] is from the current term:
    /// entries from older terms are committed transitively by a later
    /// same-term entry, never by replica count alone.
    fn advance_commit_index(&mut self) {
        let mut n = self.log.last_index();
        while n > self.commit_index {
            let replicas = 1 + self
                .config
                .others()
                .filter(|p| self.match_index.get(*p).copied().unwrap_or(0) >= n)
                .count();
            if replicas >= self.config.quorum() && self.log.term_at(n) == self.current_term {
                info!(
                    "[{}] commit index advanced to {} (term {})",
                    self.config.self_id, n, self.current_term
                );
                self.commit_index = n;
                break;
            }
            n -= 1;
        }
        self.apply_committed();
    }

    /// Apply everything up to `commit_index` in log order, completing
    /// pending client submissions along the way.
    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = self
                .log
                .at(self.last_applied)
                .expect("committed entry missing from log");
            let result = self.state_machine.apply(self.last_applied, &entry.command);
            if let Some(reply) = self.pending.remove(&self.last_applied) {
                let _ = reply.send(ClientResponse::Committed { result });
            }
        }
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            current_term: self.current_term,
            role: self.role,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            voted_for: self.voted_for.clone(),
            leader_id: self.leader_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    struct NullTransport;

    impl PeerTransport for NullTransport {
        fn call(
            &self,
            _peer: PeerId,
            _request: RpcRequest,
            _timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<RpcResponse>> + Send>> {
            Box::pin(async { Err(anyhow!("transport disabled")) })
        }
    }

    #[derive(Default)]
    struct RecordingMachine {
        applied: Arc<Mutex<Vec<String>>>,
    }

    impl StateMachine for RecordingMachine {
        fn apply(&mut self, index: u64, command: &str) -> String {
            self.applied.lock().unwrap().push(command.to_string());
            format!("ok:{}", index)
        }
    }

    fn test_node(name: &str, self_id: &str, peers: &[&str]) -> (RaftNode, Arc<Mutex<Vec<String>>>) {
        let dir = std::env::temp_dir().join(format!("quorum_log_raft_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        let config = RaftConfig::new(
            self_id.to_string(),
            peers.iter().map(|p| p.to_string()).collect(),
            dir,
        );
        let (storage, _) = Storage::open(&config.storage_path).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let election_deadline = Instant::now() + config.random_election_timeout();
        let machine = RecordingMachine::default();
        let applied = machine.applied.clone();
        let node = RaftNode {
            transport: Arc::new(NullTransport),
            state_machine: Box::new(machine),
            storage,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            role: Role::Follower,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline,
            pending: HashMap::new(),
            rx,
            tx,
            config,
        };
        (node, applied)
    }

    fn entry(term: u64, command: &str) -> LogEntry {
        LogEntry {
            term,
            command: command.to_string(),
        }
    }

    const A: &str = "127.0.0.1:7001";
    const B: &str = "127.0.0.1:7002";
    const C: &str = "127.0.0.1:7003";
    const D: &str = "127.0.0.1:7004";
    const E: &str = "127.0.0.1:7005";

    #[test]
    fn vote_granted_to_first_candidate() {
        let (mut node, _) = test_node("vote_first", A, &[A, B, C]);
        let resp = node.handle_request_vote(1, B.to_string(), 0, 0).unwrap();
        assert!(matches!(
            resp,
            RpcResponse::RequestVote {
                term: 1,
                vote_granted: true
            }
        ));
        assert_eq!(node.current_term, 1);
        assert_eq!(node.voted_for.as_deref(), Some(B));
    }

    #[test]
    fn vote_denied_to_second_candidate_same_term() {
        let (mut node, _) = test_node("vote_second", A, &[A, B, C]);
        node.handle_request_vote(1, B.to_string(), 0, 0).unwrap();
        let resp = node.handle_request_vote(1, C.to_string(), 0, 0).unwrap();
        assert!(matches!(
            resp,
            RpcResponse::RequestVote {
                vote_granted: false,
                ..
            }
        ));

        // The same candidate asking again is re-granted.
        let resp = node.handle_request_vote(1, B.to_string(), 0, 0).unwrap();
        assert!(matches!(
            resp,
            RpcResponse::RequestVote {
                vote_granted: true,
                ..
            }
        ));

        // A later term clears the old vote.
        let resp = node.handle_request_vote(2, C.to_string(), 0, 0).unwrap();
        assert!(matches!(
            resp,
            RpcResponse::RequestVote {
                term: 2,
                vote_granted: true
            }
        ));
    }

    #[test]
    fn vote_denied_when_candidate_log_behind() {
        let (mut node, _) = test_node("vote_log_behind", A, &[A, B, C]);
        node.log.append(&[entry(1, "x")]);
        node.current_term = 1;

        // Same last term, shorter log: denied. The term still advances.
        let resp = node.handle_request_vote(2, B.to_string(), 0, 0).unwrap();
        assert!(matches!(
            resp,
            RpcResponse::RequestVote {
                term: 2,
                vote_granted: false
            }
        ));
        assert_eq!(node.voted_for, None);

        // A candidate with a newer last log term wins regardless of length.
        let resp = node.handle_request_vote(3, C.to_string(), 0, 2).unwrap();
        assert!(matches!(
            resp,
            RpcResponse::RequestVote {
                term: 3,
                vote_granted: true
            }
        ));
    }

    #[test]
    fn vote_rejected_for_stale_term() {
        let (mut node, _) = test_node("vote_stale", A, &[A, B, C]);
        node.current_term = 5;
        let resp = node.handle_request_vote(3, B.to_string(), 0, 0).unwrap();
        assert!(matches!(
            resp,
            RpcResponse::RequestVote {
                term: 5,
                vote_granted: false
            }
        ));
    }

    #[test]
    fn append_entries_replicates_and_applies() {
        let (mut node, applied) = test_node("append_apply", A, &[A, B, C]);

        let resp = node
            .handle_append_entries(1, B.to_string(), 0, 0, vec![entry(1, "x")], 0)
            .unwrap();
        assert!(matches!(
            resp,
            RpcResponse::AppendEntries {
                term: 1,
                success: true
            }
        ));
        assert_eq!(node.log.last_index(), 1);
        assert_eq!(node.leader_id.as_deref(), Some(B));
        assert_eq!(node.commit_index, 0);

        // The next heartbeat carries the leader's commit index.
        node.handle_append_entries(1, B.to_string(), 1, 1, vec![], 1)
            .unwrap();
        assert_eq!(node.commit_index, 1);
        assert_eq!(node.last_applied, 1);
        assert_eq!(*applied.lock().unwrap(), vec!["x".to_string()]);
    }

    #[test]
    fn append_entries_rejects_stale_term_and_mismatch() {
        let (mut node, _) = test_node("append_reject", A, &[A, B, C]);
        node.current_term = 2;

        let resp = node
            .handle_append_entries(1, B.to_string(), 0, 0, vec![], 0)
            .unwrap();
        assert!(matches!(
            resp,
            RpcResponse::AppendEntries {
                term: 2,
                success: false
            }
        ));

        // prev_log_index past the end of our log.
        let resp = node
            .handle_append_entries(2, B.to_string(), 5, 2, vec![], 0)
            .unwrap();
        assert!(matches!(
            resp,
            RpcResponse::AppendEntries { success: false, .. }
        ));

        // Existing entry with a different term at prev_log_index.
        node.log.append(&[entry(1, "x")]);
        let resp = node
            .handle_append_entries(2, B.to_string(), 1, 2, vec![], 0)
            .unwrap();
        assert!(matches!(
            resp,
            RpcResponse::AppendEntries { success: false, .. }
        ));
    }

    #[test]
    fn append_entries_truncates_conflicting_suffix() {
        let (mut node, _) = test_node("append_truncate", A, &[A, B, C]);
        node.current_term = 1;
        node.log.append(&[entry(1, "x"), entry(1, "y")]);
        node.storage
            .append_entries(&[entry(1, "x"), entry(1, "y")])
            .unwrap();

        // A new leader at term 2 overwrites our uncommitted index-2 entry.
        let resp = node
            .handle_append_entries(2, B.to_string(), 1, 1, vec![entry(2, "z")], 0)
            .unwrap();
        assert!(matches!(
            resp,
            RpcResponse::AppendEntries {
                term: 2,
                success: true
            }
        ));
        assert_eq!(node.log.last_index(), 2);
        assert_eq!(node.log.at(1).unwrap().command, "x");
        assert_eq!(node.log.at(2).unwrap().command, "z");
        assert_eq!(node.log.at(2).unwrap().term, 2);
        assert_eq!(node.storage.last_index(), 2);
    }

    #[test]
    fn append_entries_is_idempotent_for_duplicates() {
        let (mut node, _) = test_node("append_dup", A, &[A, B, C]);
        let entries = vec![entry(1, "x"), entry(1, "y")];
        node.handle_append_entries(1, B.to_string(), 0, 0, entries.clone(), 0)
            .unwrap();
        // A retransmission of the same batch changes nothing.
        node.handle_append_entries(1, B.to_string(), 0, 0, entries, 0)
            .unwrap();
        assert_eq!(node.log.last_index(), 2);
        assert_eq!(node.storage.last_index(), 2);
    }

    #[test]
    fn follower_commit_clamped_to_log_end() {
        let (mut node, applied) = test_node("commit_clamp", A, &[A, B, C]);
        node.handle_append_entries(1, B.to_string(), 0, 0, vec![entry(1, "x")], 10)
            .unwrap();
        assert_eq!(node.commit_index, 1);
        assert_eq!(node.last_applied, 1);
        assert_eq!(applied.lock().unwrap().len(), 1);
    }

    #[test]
    fn commit_requires_current_term_entry() {
        let (mut node, _) = test_node("commit_guard", A, &[A, B, C]);

        // Leader of term 2 holding a replicated-but-uncommitted entry from
        // term 1: replica count alone must not commit it.
        node.current_term = 2;
        node.role = Role::Leader;
        node.log.append(&[entry(1, "x")]);
        node.match_index.insert(B.to_string(), 1);
        node.match_index.insert(C.to_string(), 1);
        node.advance_commit_index();
        assert_eq!(node.commit_index, 0);

        // Committing a term-2 entry commits the older one transitively.
        node.log.append(&[entry(2, "y")]);
        node.match_index.insert(B.to_string(), 2);
        node.advance_commit_index();
        assert_eq!(node.commit_index, 2);
        assert_eq!(node.last_applied, 2);
    }

    #[tokio::test]
    async fn election_wins_on_quorum_and_counts_duplicates_once() {
        let (mut node, _) = test_node("election_quorum", A, &[A, B, C, D, E]);
        node.start_election().unwrap();
        assert_eq!(node.role, Role::Candidate);
        assert_eq!(node.current_term, 1);

        let grant = RpcResponse::RequestVote {
            term: 1,
            vote_granted: true,
        };
        node.handle_response(B.to_string(), SentRpc::Vote { term: 1 }, grant.clone())
            .unwrap();
        // A duplicate grant from the same peer counts once.
        node.handle_response(B.to_string(), SentRpc::Vote { term: 1 }, grant.clone())
            .unwrap();
        assert_eq!(node.role, Role::Candidate);

        node.handle_response(C.to_string(), SentRpc::Vote { term: 1 }, grant)
            .unwrap();
        assert_eq!(node.role, Role::Leader);
        assert_eq!(node.next_index.get(B).copied(), Some(1));
        assert_eq!(node.match_index.get(C).copied(), Some(0));
    }

    #[tokio::test]
    async fn stale_vote_replies_are_discarded() {
        let (mut node, _) = test_node("election_stale", A, &[A, B, C]);
        node.start_election().unwrap();
        // Split vote: the deadline fires again and a new term begins.
        node.start_election().unwrap();
        assert_eq!(node.current_term, 2);

        let old_grant = RpcResponse::RequestVote {
            term: 1,
            vote_granted: true,
        };
        node.handle_response(B.to_string(), SentRpc::Vote { term: 1 }, old_grant)
            .unwrap();
        assert_eq!(node.role, Role::Candidate);
    }

    #[tokio::test]
    async fn single_node_cluster_elects_itself() {
        let (mut node, applied) = test_node("single_node", A, &[A]);
        node.start_election().unwrap();
        assert_eq!(node.role, Role::Leader);

        let (tx, rx) = oneshot::channel();
        node.handle_submit("x".to_string(), tx).unwrap();
        assert_eq!(node.commit_index, 1);
        assert_eq!(node.last_applied, 1);
        assert_eq!(*applied.lock().unwrap(), vec!["x".to_string()]);
        match rx.await.unwrap() {
            ClientResponse::Committed { result } => assert_eq!(result, "ok:1"),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn submit_redirects_when_not_leader() {
        let (mut node, _) = test_node("submit_redirect", A, &[A, B, C]);

        let (tx, rx) = oneshot::channel();
        node.handle_submit("x".to_string(), tx).unwrap();
        match rx.await.unwrap() {
            ClientResponse::Error { error } => assert_eq!(error, "no_leader"),
            other => panic!("unexpected response: {:?}", other),
        }

        node.leader_id = Some(B.to_string());
        let (tx, rx) = oneshot::channel();
        node.handle_submit("x".to_string(), tx).unwrap();
        match rx.await.unwrap() {
            ClientResponse::Redirect { leader_id } => assert_eq!(leader_id, B),
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(node.log.is_empty());
    }

    #[tokio::test]
    async fn successful_replication_advances_commit() {
        let (mut node, applied) = test_node("leader_commit", A, &[A, B, C]);
        node.start_election().unwrap();
        let grant = RpcResponse::RequestVote {
            term: 1,
            vote_granted: true,
        };
        node.handle_response(B.to_string(), SentRpc::Vote { term: 1 }, grant)
            .unwrap();
        assert_eq!(node.role, Role::Leader);

        let (tx, _rx) = oneshot::channel();
        node.handle_submit("x".to_string(), tx).unwrap();
        assert_eq!(node.commit_index, 0);

        // One follower acknowledging the entry makes a quorum of two.
        node.handle_response(
            B.to_string(),
            SentRpc::Append {
                term: 1,
                prev_log_index: 0,
                sent_entries: 1,
            },
            RpcResponse::AppendEntries {
                term: 1,
                success: true,
            },
        )
        .unwrap();
        assert_eq!(node.commit_index, 1);
        assert_eq!(node.match_index.get(B).copied(), Some(1));
        assert_eq!(node.next_index.get(B).copied(), Some(2));
        assert_eq!(*applied.lock().unwrap(), vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn failed_replication_backs_off_next_index() {
        let (mut node, _) = test_node("backoff", A, &[A, B, C]);
        node.start_election().unwrap();
        let grant = RpcResponse::RequestVote {
            term: 1,
            vote_granted: true,
        };
        node.handle_response(B.to_string(), SentRpc::Vote { term: 1 }, grant)
            .unwrap();
        node.log.append(&[entry(1, "x"), entry(1, "y")]);
        node.next_index.insert(B.to_string(), 3);

        let reject = RpcResponse::AppendEntries {
            term: 1,
            success: false,
        };
        node.handle_response(
            B.to_string(),
            SentRpc::Append {
                term: 1,
                prev_log_index: 2,
                sent_entries: 0,
            },
            reject.clone(),
        )
        .unwrap();
        assert_eq!(node.next_index.get(B).copied(), Some(2));

        // A duplicate of the same rejection does not double-decrement.
        node.handle_response(
            B.to_string(),
            SentRpc::Append {
                term: 1,
                prev_log_index: 2,
                sent_entries: 0,
            },
            reject,
        )
        .unwrap();
        assert_eq!(node.next_index.get(B).copied(), Some(2));
    }

    #[tokio::test]
    async fn higher_term_response_steps_leader_down() {
        let (mut node, _) = test_node("step_down", A, &[A, B, C]);
        node.start_election().unwrap();
        let grant = RpcResponse::RequestVote {
            term: 1,
            vote_granted: true,
        };
        node.handle_response(B.to_string(), SentRpc::Vote { term: 1 }, grant)
            .unwrap();
        assert_eq!(node.role, Role::Leader);

        let (tx, rx) = oneshot::channel();
        node.handle_submit("x".to_string(), tx).unwrap();

        node.handle_response(
            C.to_string(),
            SentRpc::Append {
                term: 1,
                prev_log_index: 0,
                sent_entries: 1,
            },
            RpcResponse::AppendEntries {
                term: 5,
                success: false,
            },
        )
        .unwrap();
        assert_eq!(node.role, Role::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);

        // The pending submission fails rather than hanging.
        match rx.await.unwrap() {
            ClientResponse::Error { error } => assert_eq!(error, "leadership_lost"),
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
