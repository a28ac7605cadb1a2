// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The client half of a peer: proxies, liveness probing, and on-demand wake.
//!
//! A [`Peer`] is a pure handle; construction does no I/O. Every call dials
//! a fresh connection, writes one `REQUEST` and consumes the reply frames.
//! Missing peers are never woken implicitly; callers chain
//! `ping` → `wake` → call explicitly.

use std::{path::Path, process::Stdio, sync::Arc, time::Duration};

use serde_json::{Map, Value};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::{
    config::NodeConfig,
    error::IpcError,
    protocol::{
        codec,
        types::{Envelope, CANCEL_METHOD, PING_METHOD, TASK_ID_KWARG},
    },
    registry::RegistryStore,
    transport::{self, Connection},
};

/// Default deadline for a unary reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// Fixed deadline for a liveness probe.
const PING_TIMEOUT: Duration = Duration::from_secs(1);
/// Fixed deadline for the out-of-band cancellation round trip.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(1);
/// Poll interval while waiting for a woken peer to come up.
const WAKE_POLL: Duration = Duration::from_millis(100);

/// Keyword arguments that configure the client and never reach the wire.
const CLIENT_KWARGS: [&str; 2] = ["_timeout", "_stream"];

/// Probe whether `name` currently answers on its socket.
/// Any failure (no listener, slow reply, bad frame) reads as "offline".
pub async fn ping(config: &NodeConfig, name: &str) -> bool {
    let socket = config.socket_path(name);
    let probe = async {
        let mut conn = transport::dial(&socket).await.ok()?;
        let request = Envelope::request(PING_METHOD, vec![], Map::new());
        codec::write_envelope(&mut conn, &request).await.ok()?;
        codec::read_envelope(&mut conn).await.ok().flatten()
    };
    matches!(timeout(PING_TIMEOUT, probe).await, Ok(Some(Envelope::Pong)))
}

/// Launch `name` from its registry entry and wait until it answers pings.
///
/// The child is fully detached: no inherited stdio, its own process group,
/// the descriptor's working directory. The caller neither reads from nor
/// waits on it.
pub async fn wake(config: &NodeConfig, name: &str, deadline: Duration) -> Result<(), IpcError> {
    let registry = RegistryStore::new(config.registry_path());
    let Some(descriptor) = registry.get(name)? else {
        return Err(IpcError::PeerOffline(format!(
            "no registry entry for '{name}'"
        )));
    };

    // The descriptor may be stale: the peer was moved or uninstalled since
    // it last registered. Prune it so later wakes fail fast.
    let cmd = descriptor.cmd.clone();
    let Some(target) = descriptor.launch_target() else {
        registry.prune(name);
        return Err(IpcError::PeerOffline(format!(
            "registry entry for '{name}' has an empty command"
        )));
    };
    if !Path::new(target).exists() {
        registry.prune(name);
        return Err(IpcError::PeerOffline(format!(
            "launch target '{target}' for '{name}' no longer exists"
        )));
    }

    info!(peer = name, ?cmd, "waking peer");
    spawn_detached(&cmd, &descriptor.cwd).map_err(|e| {
        IpcError::PeerOffline(format!("could not launch '{name}': {e}"))
    })?;

    let give_up = Instant::now() + deadline;
    loop {
        if ping(config, name).await {
            return Ok(());
        }
        if Instant::now() >= give_up {
            return Err(IpcError::PeerOffline(format!(
                "'{name}' did not answer within {deadline:?} of being launched"
            )));
        }
        sleep(WAKE_POLL).await;
    }
}

fn spawn_detached(cmd: &[String], cwd: &Path) -> std::io::Result<()> {
    let (program, rest) = cmd
        .split_first()
        .ok_or_else(|| std::io::Error::other("empty command"))?;
    let mut command = std::process::Command::new(program);
    command
        .args(rest)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.spawn()?;
    Ok(())
}

/// Proxy for calling operations on a named peer.
#[derive(Clone)]
pub struct Peer {
    name: String,
    config: Arc<NodeConfig>,
}

impl Peer {
    pub fn new(name: impl Into<String>, config: Arc<NodeConfig>) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unary call with the default 5 s deadline.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, IpcError> {
        self.call_with_timeout(method, args, kwargs, DEFAULT_CALL_TIMEOUT)
            .await
    }

    /// Unary call. The deadline clock starts once the request bytes are
    /// written; it does not bound the dial. A zero deadline reports a
    /// timeout without waiting for any reply.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        deadline: Duration,
    ) -> Result<Value, IpcError> {
        let mut conn = self.open().await?;
        self.send_request(&mut conn, method, args, kwargs).await?;

        if deadline.is_zero() {
            return Err(IpcError::Timeout(format!(
                "no wait requested for '{method}' on '{}'",
                self.name
            )));
        }

        let reply = timeout(deadline, codec::read_envelope(&mut conn))
            .await
            .map_err(|_| {
                IpcError::Timeout(format!(
                    "no reply from '{}' to '{method}' within {deadline:?}",
                    self.name
                ))
            })?;

        match reply.map_err(io_to_protocol)? {
            Some(Envelope::Ok { data }) => Ok(data),
            Some(Envelope::Error { msg }) => Err(IpcError::RemoteExecution(msg)),
            Some(other) => Err(IpcError::Protocol(format!(
                "expected OK or ERROR, got {}",
                other.kind()
            ))),
            None => Err(IpcError::Protocol(format!(
                "'{}' closed the connection before replying",
                self.name
            ))),
        }
    }

    /// Streaming call: returns once the server announced the task.
    pub async fn stream(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<IpcStream, IpcError> {
        let mut conn = self.open().await?;
        self.send_request(&mut conn, method, args, kwargs).await?;

        let reply = timeout(DEFAULT_CALL_TIMEOUT, codec::read_envelope(&mut conn))
            .await
            .map_err(|_| {
                IpcError::Timeout(format!(
                    "'{}' did not open a stream for '{method}' within {DEFAULT_CALL_TIMEOUT:?}",
                    self.name
                ))
            })?;

        match reply.map_err(io_to_protocol)? {
            Some(Envelope::StreamStart { task_id }) => Ok(IpcStream {
                peer: self.name.clone(),
                task_id,
                config: self.config.clone(),
                conn: Some(conn),
                cancelled: false,
            }),
            Some(Envelope::Error { msg }) => Err(IpcError::RemoteExecution(msg)),
            Some(other) => Err(IpcError::Protocol(format!(
                "expected STREAM_START, got {}",
                other.kind()
            ))),
            None => Err(IpcError::Protocol(format!(
                "'{}' closed the connection before opening the stream",
                self.name
            ))),
        }
    }

    async fn open(&self) -> Result<Connection, IpcError> {
        transport::dial(&self.config.socket_path(&self.name))
            .await
            .map_err(|e| IpcError::PeerOffline(format!("'{}' is not reachable: {e}", self.name)))
    }

    async fn send_request(
        &self,
        conn: &mut Connection,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<(), IpcError> {
        let kwargs: Map<String, Value> = kwargs
            .into_iter()
            .filter(|(k, _)| !CLIENT_KWARGS.contains(&k.as_str()))
            .collect();
        let request = Envelope::request(method, args, kwargs);
        codec::write_envelope(conn, &request).await.map_err(|e| {
            IpcError::PeerOffline(format!(
                "'{}' went away while receiving the request: {e}",
                self.name
            ))
        })
    }
}

/// Consumer side of a streaming call.
///
/// Items arrive in handler order. After `cancel()` the server may still be
/// pumping for a moment; the stream itself stops yielding immediately.
#[derive(Debug)]
pub struct IpcStream {
    peer: String,
    task_id: String,
    config: Arc<NodeConfig>,
    conn: Option<Connection>,
    cancelled: bool,
}

impl IpcStream {
    /// Server-side id of this task, as announced in `STREAM_START`.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next item, or `None` once the stream ended (normally, by
    /// cancellation, or because the peer closed the connection).
    pub async fn next(&mut self) -> Option<Result<Value, IpcError>> {
        let conn = self.conn.as_mut()?;
        match codec::read_envelope(conn).await {
            Ok(Some(Envelope::Progress { data })) => Some(Ok(data)),
            Ok(Some(Envelope::StreamEnd)) => {
                self.conn = None;
                None
            }
            Ok(Some(Envelope::Error { msg })) => {
                self.conn = None;
                Some(Err(IpcError::RemoteExecution(msg)))
            }
            Ok(Some(other)) => {
                self.conn = None;
                Some(Err(IpcError::Protocol(format!(
                    "unexpected {} frame inside a stream",
                    other.kind()
                ))))
            }
            Ok(None) => {
                self.conn = None;
                None
            }
            Err(IpcError::Protocol(msg)) => {
                self.conn = None;
                Some(Err(IpcError::Protocol(msg)))
            }
            Err(e) => {
                debug!(peer = %self.peer, "stream connection lost: {e}");
                self.conn = None;
                None
            }
        }
    }

    /// Collect the remaining items, failing on the first error.
    pub async fn collect(mut self) -> Result<Vec<Value>, IpcError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Stop iterating and ask the server to cancel the task.
    ///
    /// Idempotent. The stream connection closes first; the cancel request
    /// then travels on a fresh connection with its own short deadline, and
    /// its reply is discarded.
    pub async fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.conn = None;

        let socket = self.config.socket_path(&self.peer);
        let task_id = self.task_id.clone();
        let round_trip = async {
            let mut conn = transport::dial(&socket).await.ok()?;
            let mut kwargs = Map::new();
            kwargs.insert(TASK_ID_KWARG.into(), Value::String(task_id));
            let request = Envelope::request(CANCEL_METHOD, vec![], kwargs);
            codec::write_envelope(&mut conn, &request).await.ok()?;
            codec::read_envelope(&mut conn).await.ok().flatten()
        };
        if timeout(CANCEL_TIMEOUT, round_trip).await.is_err() {
            debug!(peer = %self.peer, task = %self.task_id, "cancel round trip timed out");
        }
    }
}

fn io_to_protocol(e: IpcError) -> IpcError {
    match e {
        IpcError::Io(msg) => IpcError::Protocol(msg),
        other => other,
    }
}
