//! Server entry + pool manager (spec §4.4): owns a named set of servers,
//! drives each through the connection state machine, runs a background
//! health-check loop, and maintains the tool→server index that
//! [`crate::strategy`] picks over.
//!
//! Grounded on the teacher's `sa-mcp-client::manager::McpManager`, which
//! owns a `HashMap<String, McpServer>` and spawns/initializes each on
//! `from_config`; this manager generalizes that into an explicit state
//! machine, retry budget, and a tool index with conflict tracking, none of
//! which the teacher needed since it assumed one winner per tool name.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::config::{ManagerConfig, ServerConfig};
use crate::error::{ClientError, InitFailure, ManagerError};
use crate::protocol::ClientInfo;
use crate::state::ConnectionState;
use crate::strategy::{SelectionStrategy, ServerSnapshot};
use crate::transport::ProcessTransport;

/// Observable snapshot of one server (spec §3, "Server status").
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub server_id: String,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub last_health_check: Option<SystemTime>,
    pub last_latency: Option<Duration>,
}

impl ServerStatus {
    /// `healthy := state == READY ∧ last_error == absent`.
    pub fn healthy(&self) -> bool {
        self.state == ConnectionState::Ready && self.last_error.is_none()
    }
}

struct ServerEntry {
    config: ServerConfig,
    client: Arc<Client>,
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<String>>,
    last_health_check: RwLock<Option<SystemTime>>,
    last_latency: RwLock<Option<Duration>>,
}

impl ServerEntry {
    async fn status(&self) -> ServerStatus {
        ServerStatus {
            server_id: self.config.id.clone(),
            state: *self.state.read().await,
            last_error: self.last_error.read().await.clone(),
            last_health_check: *self.last_health_check.read().await,
            last_latency: *self.last_latency.read().await,
        }
    }

    async fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            id: self.config.id.clone(),
            state: *self.state.read().await,
            last_latency: *self.last_latency.read().await,
        }
    }
}

/// Owns every server entry in a pool, the tool index derived from them, and
/// the background health-check loop.
pub struct PoolManager {
    config: ManagerConfig,
    client_info: ClientInfo,
    entries: RwLock<HashMap<String, Arc<ServerEntry>>>,
    /// tool name -> server ids currently advertising it. `BTreeSet` keeps
    /// the lexicographically-smallest winner a cheap `.iter().next()`.
    tool_index: RwLock<HashMap<String, BTreeSet<String>>>,
    strategy: SelectionStrategy,
    health_task: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl PoolManager {
    pub fn new(config: ManagerConfig, client_info: ClientInfo, strategy: SelectionStrategy) -> Self {
        Self {
            config,
            client_info,
            entries: RwLock::new(HashMap::new()),
            tool_index: RwLock::new(HashMap::new()),
            strategy,
            health_task: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn strategy(&self) -> &SelectionStrategy {
        &self.strategy
    }

    /// Add one server. `None` fails with [`ClientError::NullConfig`]. A
    /// disabled config is accepted but produces no entry and no connection
    /// attempt. Otherwise inserts the entry in `DISCONNECTED` and spawns the
    /// connect sequence in the background; this future completes as soon as
    /// the entry is recorded, regardless of how the connect sequence turns
    /// out (spec §4.4: "the manager reports failures via status, not via
    /// the add future").
    pub async fn add_server(self: &Arc<Self>, cfg: Option<ServerConfig>) -> Result<(), ClientError> {
        let cfg = cfg.ok_or(ClientError::NullConfig)?;
        if !cfg.enabled {
            tracing::debug!(server_id = %cfg.id, "server disabled, not adding");
            return Ok(());
        }

        let transport = ProcessTransport::new(&cfg, self.config.connection_timeout);
        let client = Arc::new(Client::new(transport, self.client_info.clone()));
        let entry = Arc::new(ServerEntry {
            config: cfg.clone(),
            client,
            state: RwLock::new(ConnectionState::Disconnected),
            last_error: RwLock::new(None),
            last_health_check: RwLock::new(None),
            last_latency: RwLock::new(None),
        });

        self.entries.write().await.insert(cfg.id.clone(), entry);

        let manager = self.clone();
        let id = cfg.id.clone();
        tokio::spawn(async move { manager.connect_sequence(&id).await });

        Ok(())
    }

    /// Convenience over `add_server(Some(cfg))` for callers that never pass
    /// an absent config.
    pub async fn add_server_config(self: &Arc<Self>, cfg: ServerConfig) -> Result<(), ClientError> {
        self.add_server(Some(cfg)).await
    }

    /// Drive one entry from `DISCONNECTED` through to `READY` (or `ERROR`),
    /// retrying transport/connect failures up to `max_retries` times.
    /// Remote `initialize` errors are terminal on the first attempt.
    async fn connect_sequence(self: Arc<Self>, id: &str) {
        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            let entry = match self.get_entry(id).await {
                Some(e) => e,
                None => return, // removed mid-connect
            };

            self.transition(id, ConnectionState::Connecting).await;
            if let Err(e) = entry.client.transport().connect().await {
                last_error = e.to_string();
                tracing::warn!(server_id = %id, attempt, error = %last_error, "MCP server connect attempt failed");
                continue;
            }

            self.transition(id, ConnectionState::Connected).await;
            self.transition(id, ConnectionState::Initializing).await;

            match entry.client.initialize().await {
                Ok(()) => {
                    self.transition(id, ConnectionState::Ready).await;
                    *entry.last_error.write().await = None;
                    self.on_server_ready(id, &entry).await;
                    tracing::info!(server_id = %id, "MCP server ready");
                    return;
                }
                Err(ClientError::InitFailed(InitFailure::Remote(remote))) => {
                    let msg = remote.to_string();
                    *entry.last_error.write().await = Some(msg.clone());
                    self.transition(id, ConnectionState::Error).await;
                    tracing::warn!(server_id = %id, error = %msg, "MCP initialize rejected by server, not retrying");
                    return;
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(server_id = %id, attempt, error = %last_error, "MCP initialize attempt failed");
                    continue;
                }
            }
        }

        if let Some(entry) = self.get_entry(id).await {
            *entry.last_error.write().await = Some(last_error);
        }
        self.transition(id, ConnectionState::Error).await;
    }

    /// Remove a server. Idempotent: absent ids succeed silently. Any call
    /// already in flight or issued concurrently with the removal fails with
    /// `ClientError::ServerRemoved` rather than a generic closed-transport
    /// error (spec §4.4).
    pub async fn remove_server(&self, id: &str) {
        let entry = self.entries.write().await.remove(id);
        if let Some(entry) = entry {
            self.remove_from_tool_index(id).await;
            entry.client.mark_removed().await;
            tracing::info!(server_id = %id, "MCP server removed from pool");
        }
    }

    /// Start the background health-check loop. Idempotent: a second call
    /// while one is already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.health_task.lock().await;
        if task.is_some() {
            return;
        }
        self.stopped.store(false, Ordering::SeqCst);

        let manager = self.clone();
        let interval = self.config.health_check_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if manager.stopped.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = manager.health_check(None).await {
                    tracing::warn!(error = %e, "broadcast health check failed");
                }
            }
        }));
    }

    /// Stop the health-check loop and remove every entry. Idempotent.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.health_task.lock().await.take() {
            handle.abort();
        }

        let ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for id in ids {
            self.remove_server(&id).await;
        }
    }

    /// Probe one server (if `id` is given) or every `READY` server in
    /// parallel (if `id` is `None`), using `tools/list` as the lightweight
    /// liveness check spec §4.4 recommends.
    pub async fn health_check(&self, id: Option<&str>) -> Result<(), ManagerError> {
        match id {
            Some(id) => self.health_check_one(id).await,
            None => {
                let ready_ids: Vec<String> = {
                    let entries = self.entries.read().await;
                    let mut ids = Vec::new();
                    for (id, entry) in entries.iter() {
                        if *entry.state.read().await == ConnectionState::Ready {
                            ids.push(id.clone());
                        }
                    }
                    ids
                };
                let checks = ready_ids.iter().map(|id| self.health_check_one(id));
                futures_util::future::join_all(checks).await;
                Ok(())
            }
        }
    }

    async fn health_check_one(&self, id: &str) -> Result<(), ManagerError> {
        let entry = self
            .get_entry(id)
            .await
            .ok_or_else(|| ManagerError::UnknownServer(id.to_string()))?;

        let start = Instant::now();
        match entry.client.list_tools().await {
            Ok(_) => {
                let elapsed = start.elapsed();
                *entry.last_latency.write().await = Some(elapsed);
                *entry.last_health_check.write().await = Some(SystemTime::now());
                *entry.last_error.write().await = None;
                tracing::debug!(server_id = %id, latency_ms = elapsed.as_millis() as u64, "MCP health probe ok");
            }
            Err(e) => {
                let msg = e.to_string();
                tracing::warn!(server_id = %id, error = %msg, "MCP health probe failed");
                *entry.last_error.write().await = Some(msg);
                self.transition(id, ConnectionState::Error).await;
            }
        }
        Ok(())
    }

    pub async fn server_ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn server_statuses(&self) -> Vec<ServerStatus> {
        let entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.status().await);
        }
        out
    }

    pub async fn get_status(&self, id: &str) -> Option<ServerStatus> {
        match self.get_entry(id).await {
            Some(entry) => Some(entry.status().await),
            None => None,
        }
    }

    pub async fn get_client(&self, id: &str) -> Option<Arc<Client>> {
        self.get_entry(id).await.map(|e| e.client.clone())
    }

    pub async fn is_server_ready(&self, id: &str) -> bool {
        match self.get_entry(id).await {
            Some(entry) => *entry.state.read().await == ConnectionState::Ready,
            None => false,
        }
    }

    /// `name -> server id`, choosing the lexicographically-smallest server
    /// id for any conflicted name so the observable winner is reproducible.
    pub async fn get_all_tools(&self) -> HashMap<String, String> {
        self.tool_index
            .read()
            .await
            .iter()
            .filter_map(|(name, ids)| ids.iter().next().map(|id| (name.clone(), id.clone())))
            .collect()
    }

    /// Only the tool names advertised by more than one server.
    pub async fn get_conflicts(&self) -> BTreeMap<String, Vec<String>> {
        self.tool_index
            .read()
            .await
            .iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(name, ids)| (name.clone(), ids.iter().cloned().collect()))
            .collect()
    }

    /// The client of the server the active strategy picks among ready
    /// servers advertising `tool_name`.
    pub async fn get_client_for_tool(&self, tool_name: &str) -> Option<Arc<Client>> {
        let candidate_ids: Vec<String> = {
            let index = self.tool_index.read().await;
            index.get(tool_name)?.iter().cloned().collect()
        };

        let entries = self.entries.read().await;
        let mut snapshots = Vec::with_capacity(candidate_ids.len());
        for id in &candidate_ids {
            if let Some(entry) = entries.get(id) {
                snapshots.push(entry.snapshot().await);
            }
        }
        drop(entries);

        let chosen = self.strategy.select(&snapshots)?;
        self.get_client(&chosen).await
    }

    async fn get_entry(&self, id: &str) -> Option<Arc<ServerEntry>> {
        self.entries.read().await.get(id).cloned()
    }

    async fn transition(&self, id: &str, new_state: ConnectionState) {
        let entry = match self.get_entry(id).await {
            Some(e) => e,
            None => return,
        };
        let old_state = {
            let mut state = entry.state.write().await;
            let old = *state;
            *state = new_state;
            old
        };
        if new_state == ConnectionState::Error {
            // Spec §7 Recovery: a server that lands in ERROR (a failed
            // health probe, a dead reconnect budget, a rejected initialize)
            // must also stop serving client operations, even though its
            // transport may still technically be alive.
            entry.client.mark_uninitialized().await;
        }
        if old_state == ConnectionState::Ready && new_state != ConnectionState::Ready {
            self.remove_from_tool_index(id).await;
        }
    }

    /// Called once an entry reaches `READY`: lists its tools and unions
    /// their names into the index.
    async fn on_server_ready(&self, id: &str, entry: &ServerEntry) {
        match entry.client.list_tools().await {
            Ok(tools) => {
                let mut index = self.tool_index.write().await;
                for tool in tools {
                    index.entry(tool.name).or_default().insert(id.to_string());
                }
            }
            Err(e) => {
                tracing::warn!(server_id = %id, error = %e, "failed to list tools after becoming ready");
            }
        }
    }

    async fn remove_from_tool_index(&self, id: &str) {
        let mut index = self.tool_index.write().await;
        index.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });
    }
}
