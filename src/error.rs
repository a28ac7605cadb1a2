// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Errors surfaced by the peer runtime.
///
/// Callers of the client engine only ever see the first five variants;
/// the remainder cover node boot and internal plumbing.
#[derive(Debug, Error, Clone)]
pub enum IpcError {
    /// The target peer is not running and (for `wake`) could not be launched.
    #[error("peer offline: {0}")]
    PeerOffline(String),

    /// No reply arrived within the caller's deadline.
    #[error("call timed out: {0}")]
    Timeout(String),

    /// The remote handler failed; the payload is the server-side error text.
    #[error("remote execution error: {0}")]
    RemoteExecution(String),

    /// Malformed envelope, unknown protocol version, or a frame that is
    /// unexpected for the current phase of the exchange.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Registry read or write failure that the retry loop could not mask.
    #[error("registry error: {0}")]
    LocalIo(String),

    /// Another process already listens under this peer name.
    #[error("peer '{0}' is already running")]
    AlreadyRunning(String),

    /// The peer name is empty or contains characters unfit for a
    /// transport address.
    #[error("invalid peer name: {0}")]
    InvalidName(String),

    /// The listener could not be bound for a reason other than a
    /// duplicate peer.
    #[error("bind error: {0}")]
    Bind(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        IpcError::Io(e.to_string())
    }
}
