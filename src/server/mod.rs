// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The server half of a peer: accept loop, per-connection workers, and the
//! table of live streaming tasks.
//!
//! Every accepted connection carries exactly one request. Unary requests are
//! answered with `OK`/`ERROR` and the connection closes; streaming requests
//! hold the connection open while `PROGRESS` frames pump, racing the task's
//! cancellation token. Cancellation arrives out of band on a separate
//! connection (`__cancel_task__`) and fires the token found in the task
//! table.

pub mod ops;
pub mod tasks;

use std::{path::PathBuf, sync::Arc, time::Duration};

use futures::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::IpcError,
    protocol::{
        codec,
        types::{Envelope, CANCEL_METHOD, PING_METHOD, TASK_ID_KWARG},
    },
    transport::{Connection, PeerListener},
};

use ops::{Invocation, OperationTable, Reply};
use tasks::TaskTable;

/// Pause before attempting to re-bind after a fatal accept error.
const REBIND_BACKOFF: Duration = Duration::from_secs(1);

/// Owns the accept loop of one peer. Constructed by the node facade after
/// the singleton probe has succeeded and the listener is bound.
pub(crate) struct ServerEngine {
    name: String,
    socket_path: PathBuf,
    ops: Arc<OperationTable>,
    tasks: Arc<TaskTable>,
    shutdown: CancellationToken,
}

impl ServerEngine {
    pub(crate) fn new(
        name: String,
        socket_path: PathBuf,
        ops: Arc<OperationTable>,
        tasks: Arc<TaskTable>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name,
            socket_path,
            ops,
            tasks,
            shutdown,
        }
    }

    /// Run the accept loop until the shutdown token fires. Each accepted
    /// connection is served on its own task; a fatal accept error backs off
    /// and re-binds without taking the process down.
    pub(crate) async fn run(self, listener: PeerListener) {
        info!(peer = %self.name, "server loop started");
        let mut listener = Some(listener);

        loop {
            // The accept result is pulled out of the borrow of `listener`
            // before it is acted on, so a failed listener can be replaced.
            let accepted = match listener.as_ref() {
                Some(active) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        res = active.accept() => Some(res),
                    }
                }
                None => None,
            };

            match accepted {
                Some(Ok(conn)) => {
                    tokio::spawn(serve_connection(
                        self.ops.clone(),
                        self.tasks.clone(),
                        self.shutdown.clone(),
                        conn,
                    ));
                }
                Some(Err(e)) => {
                    warn!(peer = %self.name, "accept failed: {e}");
                    listener = None;
                }
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(REBIND_BACKOFF) => {}
                    }
                    // Same dial-confirmed sequence as boot: a twin that took
                    // the address during the outage keeps it untouched, and
                    // we simply stay in backoff until it goes away.
                    match crate::transport::bind_or_probe(&self.socket_path).await {
                        Ok(l) => {
                            info!(peer = %self.name, "listener re-bound");
                            listener = Some(l);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                            warn!(peer = %self.name, "another instance answers on this address");
                        }
                        Err(e) => warn!(peer = %self.name, "re-bind failed: {e}"),
                    }
                }
            }
        }

        // Only unlink the socket file while still holding the listener; in
        // the outage state the path may already belong to a twin.
        if let Some(active) = listener.take() {
            drop(active);
            let _ = crate::transport::remove_stale_socket(&self.socket_path);
        }
        info!(peer = %self.name, "server loop stopped");
    }
}

/// Serve one connection: read the single request envelope and dispatch it.
async fn serve_connection(
    ops: Arc<OperationTable>,
    tasks: Arc<TaskTable>,
    shutdown: CancellationToken,
    mut conn: Connection,
) {
    let envelope = match codec::read_envelope(&mut conn).await {
        Ok(Some(env)) => env,
        Ok(None) => return,
        Err(e) => {
            debug!("dropping connection with unreadable request: {e}");
            return;
        }
    };
    let Envelope::Request {
        method,
        args,
        kwargs,
    } = envelope
    else {
        debug!("dropping connection that opened with a non-request frame");
        return;
    };

    match method.as_str() {
        PING_METHOD => {
            let _ = codec::write_envelope(&mut conn, &Envelope::Pong).await;
        }
        CANCEL_METHOD => {
            cancel_task(&tasks, &kwargs);
            let _ = codec::write_envelope(&mut conn, &Envelope::Ok { data: Value::Null }).await;
        }
        _ => dispatch(ops, tasks, shutdown, conn, method, args, kwargs).await,
    }
}

/// Fire the cancellation token named in the request, if the task is still
/// live. Unknown and unparsable ids are no-ops: the task may simply have
/// finished before the cancel arrived.
fn cancel_task(tasks: &TaskTable, kwargs: &Map<String, Value>) {
    let Some(id) = kwargs.get(TASK_ID_KWARG).and_then(Value::as_str) else {
        debug!("cancel request without a task id");
        return;
    };
    match Uuid::parse_str(id) {
        Ok(id) => {
            let found = tasks.cancel(&id);
            debug!(task = %id, found, "cancel requested");
        }
        Err(_) => debug!(task = id, "cancel request with unparsable task id"),
    }
}

async fn dispatch(
    ops: Arc<OperationTable>,
    tasks: Arc<TaskTable>,
    shutdown: CancellationToken,
    mut conn: Connection,
    method: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
) {
    let Some(op) = ops.get(&method) else {
        let _ = codec::write_envelope(
            &mut conn,
            &Envelope::error(format!("method not found: {method}")),
        )
        .await;
        return;
    };

    // Underscore-prefixed keywords are client-side directives, never
    // handler arguments.
    let kwargs: Map<String, Value> = kwargs
        .into_iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .collect();

    match op.invoke(Invocation::new(args, kwargs)).await {
        Err(e) => {
            debug!(%method, "handler failed: {e}");
            let _ = codec::write_envelope(&mut conn, &Envelope::error(e)).await;
        }
        Ok(Reply::Value(value)) => {
            let _ = codec::write_envelope(&mut conn, &Envelope::Ok { data: value }).await;
        }
        Ok(Reply::Stream(stream)) => {
            pump_stream(&tasks, &shutdown, &mut conn, &method, stream).await;
        }
    }
}

/// Drive one streaming task: announce it, pump `PROGRESS` frames until the
/// sequence ends, the handler fails, the cancel token fires, or the client
/// goes away; then terminate the stream and drop the task entry.
async fn pump_stream(
    tasks: &TaskTable,
    shutdown: &CancellationToken,
    conn: &mut Connection,
    method: &str,
    mut stream: ops::ValueStream,
) {
    let task_id = Uuid::new_v4();
    let token = shutdown.child_token();
    tasks.insert(task_id, token.clone());
    debug!(%method, task = %task_id, "stream started");

    let outcome: Result<(), IpcError> = async {
        codec::write_envelope(
            conn,
            &Envelope::StreamStart {
                task_id: task_id.to_string(),
            },
        )
        .await?;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(task = %task_id, "stream cancelled");
                    codec::write_envelope(conn, &Envelope::StreamEnd).await?;
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(value)) => {
                        codec::write_envelope(conn, &Envelope::Progress { data: value }).await?;
                    }
                    Some(Err(e)) => {
                        debug!(task = %task_id, "stream handler failed: {e}");
                        codec::write_envelope(conn, &Envelope::error(e)).await?;
                        break;
                    }
                    None => {
                        codec::write_envelope(conn, &Envelope::StreamEnd).await?;
                        break;
                    }
                },
            }
        }
        Ok(())
    }
    .await;

    tasks.remove(&task_id);
    if let Err(e) = outcome {
        // Write failures mean the client disconnected mid-stream; the task
        // entry is already gone, which is all that matters here.
        debug!(task = %task_id, "stream connection lost: {e}");
    }
}
