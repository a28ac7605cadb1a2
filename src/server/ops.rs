// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The exposed-operation table and the handler contract.
//!
//! A handler consumes positional and keyword arguments and produces either a
//! single value or a lazy, finite sequence of values. Failures are plain
//! `anyhow` errors; the server renders their message into an `ERROR` frame,
//! so handlers never take the process down.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use futures::Stream;
use serde_json::{Map, Value};

/// Arguments of one invocation, as they arrived on the wire (minus the
/// underscore-prefixed keywords the server strips off).
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Invocation {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }
}

/// Lazy sequence produced by a streaming handler. An `Err` item aborts the
/// stream and reaches the caller as a remote execution error.
pub type ValueStream = Pin<Box<dyn Stream<Item = anyhow::Result<Value>> + Send>>;

/// What a handler produced.
pub enum Reply {
    Value(Value),
    Stream(ValueStream),
}

/// One exposed operation.
///
/// Cancellation is cooperative and only reaches streaming replies, between
/// items. A unary handler always runs to completion once started.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn invoke(&self, inv: Invocation) -> anyhow::Result<Reply>;
}

/// Adapt an async closure returning a single value.
pub fn unary<F, Fut>(f: F) -> Arc<dyn Operation>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    struct UnaryFn<F>(F);

    #[async_trait]
    impl<F, Fut> Operation for UnaryFn<F>
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        async fn invoke(&self, inv: Invocation) -> anyhow::Result<Reply> {
            Ok(Reply::Value((self.0)(inv).await?))
        }
    }

    Arc::new(UnaryFn(f))
}

/// Adapt an async closure returning a lazy sequence.
pub fn streaming<F, Fut>(f: F) -> Arc<dyn Operation>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ValueStream>> + Send + 'static,
{
    struct StreamingFn<F>(F);

    #[async_trait]
    impl<F, Fut> Operation for StreamingFn<F>
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ValueStream>> + Send + 'static,
    {
        async fn invoke(&self, inv: Invocation) -> anyhow::Result<Reply> {
            Ok(Reply::Stream((self.0)(inv).await?))
        }
    }

    Arc::new(StreamingFn(f))
}

/// Per-process mapping of operation names to handlers.
///
/// Populated while the node boots and effectively read-only once the server
/// loop runs; the lock is held only around map operations.
pub struct OperationTable {
    ops: RwLock<HashMap<String, Arc<dyn Operation>>>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self {
            ops: RwLock::new(HashMap::new()),
        }
    }

    /// Register `op` under `name`. Re-registering a name replaces the
    /// previous handler.
    pub fn register(&self, name: impl Into<String>, op: Arc<dyn Operation>) {
        self.ops.write().unwrap().insert(name.into(), op);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.ops.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ops.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for OperationTable {
    fn default() -> Self {
        Self::new()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
