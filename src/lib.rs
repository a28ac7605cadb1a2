// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Peer-to-peer IPC runtime for a small mesh of cooperating desktop
//! processes. Every process is both a server (exposing named operations)
//! and a client (calling operations on other peers by name), with
//! singleton enforcement per peer name and on-demand launching of missing
//! peers from a shared on-disk registry.

pub mod client;
pub mod config;
pub mod error;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;

pub use client::{ping, wake, IpcStream, Peer, DEFAULT_CALL_TIMEOUT};
pub use config::{default_base_dir, validate_peer_name, NodeConfig, SOCKET_PREFIX};
pub use error::IpcError;
pub use node::PeerNode;
pub use protocol::types::{Envelope, CANCEL_METHOD, PING_METHOD, PROTOCOL_VERSION};
pub use registry::{LaunchDescriptor, LaunchMode, RegistryStore};
pub use server::ops;
pub use server::ops::{Invocation, Operation, OperationTable, Reply, ValueStream};
