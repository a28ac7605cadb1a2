// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The peer node: one object whose lifetime is the process's membership in
//! the mesh.
//!
//! Booting performs, in order: name validation, the singleton bind (with a
//! dial probe that resolves crash leftovers on the address), registry
//! self-registration, and the start of the server loop. A second instance
//! of the same peer name gets [`IpcError::AlreadyRunning`]; binaries
//! translate that into a clean exit with status 0, because a duplicate is
//! not a failure.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use neverliie::{ops, NodeConfig, PeerNode};
//! # use serde_json::json;
//! # async fn example() -> Result<(), neverliie::IpcError> {
//! let node = PeerNode::start("launcher", NodeConfig::new()).await?;
//! node.expose("add", ops::unary(|inv| async move {
//!     let a = inv.args[0].as_i64().unwrap_or(0);
//!     let b = inv.args[1].as_i64().unwrap_or(0);
//!     Ok(json!(a + b))
//! }));
//!
//! // Call another peer, waking it first if needed.
//! if !node.ping("term").await {
//!     node.wake("term", std::time::Duration::from_secs(5)).await?;
//! }
//! let sum = node
//!     .get_peer("term")
//!     .call("add", vec![json!(2), json!(3)], Default::default())
//!     .await?;
//! assert_eq!(sum, json!(5));
//! # Ok(())
//! # }
//! ```

use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    client::{self, Peer},
    config::{validate_peer_name, NodeConfig},
    error::IpcError,
    registry::{LaunchDescriptor, RegistryStore},
    server::{
        ops::{Operation, OperationTable},
        tasks::TaskTable,
        ServerEngine,
    },
    transport,
};

pub struct PeerNode {
    name: String,
    config: Arc<NodeConfig>,
    ops: Arc<OperationTable>,
    tasks: Arc<TaskTable>,
    registry: RegistryStore,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerNode {
    /// Boot this process as peer `name`.
    pub async fn start(name: impl Into<String>, config: NodeConfig) -> Result<Self, IpcError> {
        let name = name.into();
        validate_peer_name(&name)?;
        let config = Arc::new(config);

        std::fs::create_dir_all(&config.base_dir)
            .map_err(|e| IpcError::Bind(format!("could not create {}: {e}", config.base_dir.display())))?;

        // Singleton bind: races are settled by the bind itself, and a crash
        // leftover is only unlinked right after a dial confirmed it is dead.
        // `AddrInUse` from either attempt means a twin holds the name.
        let socket_path = config.socket_path(&name);
        let listener = match transport::bind_or_probe(&socket_path).await {
            Ok(l) => l,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                return Err(IpcError::AlreadyRunning(name));
            }
            Err(e) => return Err(IpcError::Bind(e.to_string())),
        };

        // Re-assert our registry entry so other peers can wake us later.
        let descriptor = match &config.launch {
            Some(d) => d.clone(),
            None => LaunchDescriptor::for_current_process()?,
        };
        let registry = RegistryStore::new(config.registry_path());
        registry.put(&name, &descriptor);

        let ops = Arc::new(OperationTable::new());
        let tasks = Arc::new(TaskTable::new());
        let shutdown = CancellationToken::new();

        let engine = ServerEngine::new(
            name.clone(),
            socket_path,
            ops.clone(),
            tasks.clone(),
            shutdown.clone(),
        );
        let accept_task = tokio::spawn(engine.run(listener));

        info!(peer = %name, base = %config.base_dir.display(), "peer node started");
        Ok(Self {
            name,
            config,
            ops,
            tasks,
            registry,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    /// Register `op` under `name` for remote callers.
    pub fn expose(&self, name: impl Into<String>, op: Arc<dyn Operation>) {
        self.ops.register(name, op);
    }

    /// Proxy for `name`. Pure factory: no I/O until the first call.
    pub fn get_peer(&self, name: impl Into<String>) -> Peer {
        Peer::new(name, self.config.clone())
    }

    /// Probe whether `name` currently answers.
    pub async fn ping(&self, name: &str) -> bool {
        client::ping(&self.config, name).await
    }

    /// Launch `name` from the registry and wait until it answers.
    pub async fn wake(&self, name: &str, deadline: Duration) -> Result<(), IpcError> {
        client::wake(&self.config, name, deadline).await
    }

    /// Number of streaming tasks currently live on this node's server.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop serving: fires the shutdown signal (which also cancels every
    /// in-flight stream through the task-table pathway), closes the
    /// listener and joins the accept loop. Connections already being served
    /// finish on their own. The registry entry stays, so the peer remains
    /// wakeable.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.accept_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(peer = %self.name, "peer node stopped");
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        // Unblocks the accept loop even without an explicit shutdown; the
        // loop removes the socket file on its way out.
        self.shutdown.cancel();
    }
}
