//! Client-side sync provider.
//!
//! ```text
//!  app edit ──► SharedDoc ──► LocalPersistence (writer task) ──► RocksDB
//!                   │
//!                   └──► transport task ══ WebSocket ══► relay
//!                          │      ▲
//!                          │      └── ReconnectMachine (backoff)
//!                          ▼
//!                   status (watch) ◄── liveness task (LivenessProbe)
//! ```
//!
//! Local edits never wait for the network. While disconnected they are only
//! persisted; the next handshake ships everything the relay is missing, so
//! there is no separate offline queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use aegis_core::{ReplicaDoc, ReplicaError, SharedDoc};

use crate::protocol::Message;
use crate::reconnect::{
    BackoffConfig, Clock, ConnectionStatus, LivenessProbe, ProbeOutcome, ReconnectAction,
    ReconnectMachine, SystemClock,
};
use crate::session::SyncSession;
use crate::storage::{
    LocalPersistence, PersistHandle, StoreConfig, StoreError, DEFAULT_COMPACTION_THRESHOLD,
};
use crate::DEFAULT_DOCUMENT;

pub const DEFAULT_SYNC_URL: &str = "ws://localhost:1234";
pub const DEFAULT_LOCAL_STORE: &str = "aegis_local";

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, without the room
    pub server_url: String,
    /// Document (room) name
    pub document: String,
    /// Local store directory (None = no durable mirror)
    pub local_store: Option<PathBuf>,
    /// Appended updates before the local log is compacted
    pub compaction_threshold: u64,
    pub backoff: BackoffConfig,
    /// Period of the liveness check
    pub liveness_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SYNC_URL.to_string(),
            document: DEFAULT_DOCUMENT.to_string(),
            local_store: Some(PathBuf::from(DEFAULT_LOCAL_STORE)),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            backoff: BackoffConfig::default(),
            liveness_interval: LivenessProbe::DEFAULT_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Read `AEGIS_SYNC_URL` and `AEGIS_LOCAL_STORE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup("AEGIS_SYNC_URL").filter(|v| !v.trim().is_empty()) {
            config.server_url = url.trim().to_string();
        }
        if let Some(path) = lookup("AEGIS_LOCAL_STORE").filter(|v| !v.trim().is_empty()) {
            config.local_store = Some(PathBuf::from(path));
        }
        config
    }

    /// Fast backoff against a test relay.
    pub fn for_testing(server_url: impl Into<String>, local_store: Option<PathBuf>) -> Self {
        Self {
            server_url: server_url.into(),
            local_store,
            compaction_threshold: 50,
            backoff: BackoffConfig::for_testing(),
            ..Self::default()
        }
    }

    /// Full WebSocket URL of the document's room.
    pub fn room_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.document)
    }
}

/// Provider errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Local storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),
    #[error("Sync provider has stopped")]
    Stopped,
}

/// Keeps one document in sync with the relay and mirrored on disk.
pub struct SyncProvider<D> {
    config: ClientConfig,
    doc: SharedDoc<D>,
    persistence: Option<LocalPersistence>,
    local_tx: mpsc::UnboundedSender<Vec<u8>>,
    status: watch::Receiver<ConnectionStatus>,
    last_synced: watch::Receiver<Option<SystemTime>>,
    revision: watch::Receiver<u64>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<D: ReplicaDoc> SyncProvider<D> {
    /// Load the local mirror into `doc`, then start syncing.
    ///
    /// Returns only after persisted state is in `doc`; a storage failure
    /// aborts startup.
    pub async fn start(config: ClientConfig, doc: SharedDoc<D>) -> Result<Self, ClientError> {
        Self::start_with_clock(config, doc, Arc::new(SystemClock)).await
    }

    pub async fn start_with_clock(
        config: ClientConfig,
        doc: SharedDoc<D>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ClientError> {
        let persistence = match &config.local_store {
            Some(path) => {
                let store_config = StoreConfig::at(path);
                let name = config.document.clone();
                let threshold = config.compaction_threshold;
                let target = doc.clone();
                let opened = tokio::task::spawn_blocking(move || {
                    LocalPersistence::open(store_config, &name, &target, threshold)
                })
                .await
                .map_err(|_| ClientError::Stopped)??;
                Some(opened)
            }
            None => None,
        };

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (synced_tx, synced_rx) = watch::channel(None);
        let (revision_tx, revision_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (local_tx, local_rx) = mpsc::unbounded_channel();

        let transport = Transport {
            url: config.room_url(),
            doc: doc.clone(),
            persist: persistence.as_ref().map(LocalPersistence::handle),
            backoff: config.backoff.clone(),
            clock: clock.clone(),
            status_tx,
            synced_tx: synced_tx.clone(),
            revision_tx,
            local_rx,
            shutdown: shutdown_rx.clone(),
        };
        let probe = LivenessProbe::new(config.liveness_interval, clock.now());

        let tasks = vec![
            tokio::spawn(transport.run()),
            tokio::spawn(run_liveness(
                probe,
                clock,
                status_rx.clone(),
                synced_tx,
                shutdown_rx,
            )),
        ];
        log::info!("Sync provider started for {}", config.room_url());

        Ok(Self {
            config,
            doc,
            persistence,
            local_tx,
            status: status_rx,
            last_synced: synced_rx,
            revision: revision_rx,
            shutdown: shutdown_tx,
            tasks,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn doc(&self) -> &SharedDoc<D> {
        &self.doc
    }

    /// Run a local edit and publish the update it returns.
    pub fn edit(
        &self,
        f: impl FnOnce(&mut D) -> Result<Vec<u8>, ReplicaError>,
    ) -> Result<Vec<u8>, ClientError> {
        let update = self.doc.with(f)?;
        self.publish(update.clone())?;
        Ok(update)
    }

    /// Persist a local update and send it to the relay when connected.
    ///
    /// `update` must already be applied to the document.
    pub fn publish(&self, update: Vec<u8>) -> Result<(), ClientError> {
        if let Some(persistence) = &self.persistence {
            persistence.enqueue(update.clone())?;
        }
        self.local_tx
            .send(update)
            .map_err(|_| ClientError::Stopped)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Resolve once the status equals `target`.
    pub async fn wait_for_status(&self, target: ConnectionStatus) -> Result<(), ClientError> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Stopped)
    }

    /// Time of the last completed handshake or successful liveness check.
    pub fn last_synced(&self) -> Option<SystemTime> {
        *self.last_synced.borrow()
    }

    /// Counter bumped whenever a remote update changes the document.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.revision.clone()
    }

    /// Resolve once every update published so far is durable.
    pub async fn flush(&self) -> Result<(), ClientError> {
        match &self.persistence {
            Some(persistence) => Ok(persistence.flush().await?),
            None => Ok(()),
        }
    }

    /// Disconnect, stop background tasks and close the local store.
    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        self.shutdown.send_replace(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                log::error!("Sync provider task failed: {e}");
            }
        }
        match self.persistence.take() {
            Some(persistence) => Ok(persistence.close().await?),
            None => Ok(()),
        }
    }
}

impl<D> Drop for SyncProvider<D> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// How one connection ended.
enum LinkEnd {
    Lost,
    Shutdown,
}

/// State owned by the transport task.
struct Transport<D> {
    url: String,
    doc: SharedDoc<D>,
    persist: Option<PersistHandle>,
    backoff: BackoffConfig,
    clock: Arc<dyn Clock>,
    status_tx: watch::Sender<ConnectionStatus>,
    synced_tx: watch::Sender<Option<SystemTime>>,
    revision_tx: watch::Sender<u64>,
    local_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: watch::Receiver<bool>,
}

impl<D: ReplicaDoc> Transport<D> {
    async fn run(mut self) {
        let mut machine = ReconnectMachine::new(self.backoff.clone());
        let mut action = machine.start();

        loop {
            action = match action {
                ReconnectAction::Connect => match self.connect_once(&mut machine).await {
                    LinkEnd::Lost => machine.on_failure(self.clock.now()),
                    LinkEnd::Shutdown => machine.stop(),
                },
                ReconnectAction::RetryAfter(delay) => {
                    log::debug!("Reconnecting to {} in {delay:?}", self.url);
                    if self.wait(delay).await {
                        machine.on_retry(self.clock.now())
                    } else {
                        machine.stop()
                    }
                }
                ReconnectAction::Stop => break,
            };
            self.publish_status(machine.status());
        }

        log::info!("Sync transport for {} stopped", self.url);
    }

    fn publish_status(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                log::info!("Sync status for {}: {status:?}", self.url);
                *current = status;
                true
            }
        });
    }

    /// Sleep for `delay`. Returns false if the provider shut down meanwhile.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.shutdown.changed() => return false,
                // Already in the document and the local store; the next
                // handshake sends it.
                local = self.local_rx.recv() => {
                    if local.is_none() {
                        return false;
                    }
                }
            }
        }
    }

    async fn connect_once(&mut self, machine: &mut ReconnectMachine) -> LinkEnd {
        let connect = tokio::time::timeout(
            self.backoff.connection_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        );
        let ws = tokio::select! {
            _ = self.shutdown.changed() => return LinkEnd::Shutdown,
            result = connect => match result {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => {
                    log::warn!("Connection to {} failed: {e}", self.url);
                    return LinkEnd::Lost;
                }
                Err(_) => {
                    log::warn!("Connection to {} timed out", self.url);
                    return LinkEnd::Lost;
                }
            },
        };
        log::debug!("WebSocket open to {}", self.url);

        let (mut sink, mut source) = ws.split();
        let mut session = SyncSession::new(self.doc.clone(), self.url.clone());
        if let Err(e) = sink.send(WsMessage::Binary(session.open().into())).await {
            log::warn!("Failed to start handshake with {}: {e}", self.url);
            return LinkEnd::Lost;
        }

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return LinkEnd::Shutdown;
                }

                incoming = source.next() => match incoming {
                    Some(Ok(WsMessage::Binary(data))) => {
                        let was_synced = session.is_synced();
                        let output = match session.on_frame(&data) {
                            Ok(output) => output,
                            Err(e) => {
                                log::warn!("Dropping connection to {}: {e}", self.url);
                                return LinkEnd::Lost;
                            }
                        };

                        for reply in output.replies {
                            if let Err(e) = sink.send(WsMessage::Binary(reply.into())).await {
                                log::warn!("Send to {} failed: {e}", self.url);
                                return LinkEnd::Lost;
                            }
                        }
                        if let Some(update) = output.applied {
                            self.persist(update);
                            self.revision_tx.send_modify(|rev| *rev += 1);
                        }
                        if !was_synced && session.is_synced() {
                            machine.on_synced();
                            self.synced_tx.send_replace(Some(self.clock.wall_time()));
                            self.publish_status(machine.status());
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("Relay closed connection {}", self.url);
                        return LinkEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Connection to {} lost: {e}", self.url);
                        return LinkEnd::Lost;
                    }
                },

                local = self.local_rx.recv() => match local {
                    Some(update) => {
                        let frame = Message::update(update).encode();
                        if let Err(e) = sink.send(WsMessage::Binary(frame.into())).await {
                            log::warn!("Send to {} failed: {e}", self.url);
                            return LinkEnd::Lost;
                        }
                    }
                    None => return LinkEnd::Shutdown,
                },
            }
        }
    }

    fn persist(&self, update: Vec<u8>) {
        if let Some(persist) = &self.persist {
            if let Err(e) = persist.enqueue(update) {
                log::error!("Failed to queue remote update for storage: {e}");
            }
        }
    }
}

/// Single repeating timer; a slow check delays the next one instead of
/// overlapping it.
async fn run_liveness(
    mut probe: LivenessProbe,
    clock: Arc<dyn Clock>,
    status: watch::Receiver<ConnectionStatus>,
    synced_tx: watch::Sender<Option<SystemTime>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = probe.interval().max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let current = *status.borrow();
        match probe.poll(clock.as_ref(), current) {
            ProbeOutcome::Refreshed(at) => {
                synced_tx.send_replace(Some(at));
                log::debug!("Liveness check: connected");
            }
            ProbeOutcome::Offline => log::info!("Liveness check: offline, reconnect pending"),
            ProbeOutcome::NotDue => {}
        }
    }
}
