//! Registry task with tokio mpsc command pattern.
//!
//! The [`PeerRegistry`] map lives inside one task. Discovery, messaging,
//! the world relay and the engine all talk to it through a cloneable
//! [`RegistryHandle`]; queries are answered over oneshot channels. The task
//! also runs the LAN expiry tick and publishes `PeerUp` / `PeerDown` on the
//! event bus.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use xui_shared::constants::GC_INTERVAL;
use xui_shared::error::{Result, XuiError};
use xui_shared::types::{NodeId, PeerSource};

use crate::events::{EngineEvent, EventBus};
use crate::peers::{Candidate, PeerRecord, PeerRegistry};
use crate::shutdown::{self, ShutdownRx};

// ---------------------------------------------------------------------------
// Command types
// ---------------------------------------------------------------------------

/// Commands sent *into* the registry task.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Insert or refresh a peer.
    Upsert {
        name: String,
        host: String,
        port: u16,
        source: PeerSource,
        node_id: NodeId,
    },
    /// Remove a peer by `host:port` key.
    Remove(String),
    /// Run one expiry pass now.
    GcTick,
    /// Request a snapshot of all records.
    Snapshot(oneshot::Sender<Vec<PeerRecord>>),
    /// Request ranked delivery candidates for `host:port`.
    Candidates {
        host: String,
        port: u16,
        reply: oneshot::Sender<Vec<Candidate>>,
    },
}

/// Cloneable front door to the registry task.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

/// The not-yet-running task half, returned by [`RegistryHandle::channel`].
pub struct RegistryActor {
    rx: mpsc::Receiver<RegistryCommand>,
    registry: PeerRegistry,
    bus: EventBus,
    gc_interval: Duration,
}

impl RegistryHandle {
    /// Create the handle and the task half. Commands queue until the actor
    /// is run, so the handle is usable before the engine starts.
    pub fn channel(bus: EventBus) -> (RegistryHandle, RegistryActor) {
        let (tx, rx) = mpsc::channel(256);
        let actor = RegistryActor {
            rx,
            registry: PeerRegistry::new(),
            bus,
            gc_interval: GC_INTERVAL,
        };
        (RegistryHandle { tx }, actor)
    }

    async fn send(&self, cmd: RegistryCommand) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| XuiError::EngineStopped)
    }

    pub async fn upsert(
        &self,
        name: &str,
        host: &str,
        port: u16,
        source: PeerSource,
        node_id: &NodeId,
    ) -> Result<()> {
        self.send(RegistryCommand::Upsert {
            name: name.to_string(),
            host: host.to_string(),
            port,
            source,
            node_id: node_id.clone(),
        })
        .await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.send(RegistryCommand::Remove(key.to_string())).await
    }

    pub async fn gc_tick(&self) -> Result<()> {
        self.send(RegistryCommand::GcTick).await
    }

    pub async fn snapshot(&self) -> Result<Vec<PeerRecord>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RegistryCommand::Snapshot(reply_tx)).await?;
        reply_rx.await.map_err(|_| XuiError::EngineStopped)
    }

    pub async fn candidates(&self, host: &str, port: u16) -> Result<Vec<Candidate>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RegistryCommand::Candidates {
            host: host.to_string(),
            port,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| XuiError::EngineStopped)
    }
}

impl RegistryActor {
    /// Override the expiry tick (tests drive expiry through `GcTick`).
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Override the record store, e.g. with a shorter LAN TTL.
    pub fn with_registry(mut self, registry: PeerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Run until shutdown is signalled or every handle is dropped.
    pub async fn run(mut self, mut shutdown_rx: ShutdownRx) {
        let mut gc = tokio::time::interval(self.gc_interval);
        gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Peer registry started");

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd),
                        None => {
                            debug!("Registry command channel closed");
                            break;
                        }
                    }
                }
                _ = gc.tick() => self.expire(),
                _ = shutdown::requested(&mut shutdown_rx) => break,
            }
        }

        info!(peers = self.registry.len(), "Peer registry stopped");
    }

    fn handle(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Upsert {
                name,
                host,
                port,
                source,
                node_id,
            } => {
                if let Some(record) =
                    self.registry
                        .upsert(&name, &host, port, source, &node_id, Instant::now())
                {
                    info!(peer = %record.key(), name = %record.name, source = %record.source, "Peer up");
                    self.bus.emit(EngineEvent::PeerUp(record));
                }
            }
            RegistryCommand::Remove(key) => {
                if self.registry.remove(&key).is_some() {
                    info!(peer = %key, "Peer removed");
                    self.bus.emit(EngineEvent::PeerDown { key });
                }
            }
            RegistryCommand::GcTick => self.expire(),
            RegistryCommand::Snapshot(reply) => {
                let _ = reply.send(self.registry.snapshot());
            }
            RegistryCommand::Candidates { host, port, reply } => {
                let _ = reply.send(self.registry.candidates(&host, port));
            }
        }
    }

    fn expire(&mut self) {
        for key in self.registry.gc(Instant::now()) {
            info!(peer = %key, "Peer timed out");
            self.bus.emit(EngineEvent::PeerDown { key });
        }
    }
}
