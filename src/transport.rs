// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Host-local duplex channel between peers.
//!
//! Each peer listens on a Unix domain socket named after it
//! (`<base_dir>/NeverLiie_<name>`). Binding is exclusive: a second listener
//! for the same address fails with `AddrInUse`. Races over the address are
//! always resolved by losing a `bind`; a socket file left behind by a
//! crashed peer is only removed immediately after a probe dial has confirmed
//! nothing answers on it (see [`bind_or_probe`]), which keeps the
//! exclusivity guarantee intact.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::net::{UnixListener, UnixStream};

/// One bidirectional byte channel; lives for a single client call.
pub type Connection = UnixStream;

/// Passive side of the transport.
pub struct PeerListener {
    inner: UnixListener,
    path: PathBuf,
}

impl PeerListener {
    /// Bind the listener. Fails with `AddrInUse` when the address is taken,
    /// by a live peer or by a stale socket file the caller has not probed
    /// and removed yet.
    pub fn bind(path: &Path) -> io::Result<Self> {
        let inner = UnixListener::bind(path)?;
        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> io::Result<Connection> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Active side: connect to the peer listening on `path`.
///
/// Fails fast when no listener is bound (`NotFound` for a never-created
/// address, `ConnectionRefused` for a stale socket file).
pub async fn dial(path: &Path) -> io::Result<Connection> {
    UnixStream::connect(path).await
}

/// Bind `path`, clearing a crash leftover without ever unlinking a live
/// listener's socket.
///
/// The bind comes first. Only when it fails with `AddrInUse` does a dial
/// decide what holds the address: something answers and `AddrInUse` is
/// returned unchanged (a live twin), or nothing does and the dead file is
/// unlinked right after that confirming dial, with exactly one follow-up
/// bind attempt. `AddrInUse` from the retry means a twin won the race in
/// the meantime.
pub async fn bind_or_probe(path: &Path) -> io::Result<PeerListener> {
    match PeerListener::bind(path) {
        Ok(listener) => return Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {}
        Err(e) => return Err(e),
    }
    if dial(path).await.is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "a live listener answers on this address",
        ));
    }
    remove_stale_socket(path)?;
    PeerListener::bind(path)
}

/// Remove a socket file that a dial has just shown to be dead. Callers must
/// keep the confirming dial and this unlink adjacent; anything answering on
/// the path owns it.
pub fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
