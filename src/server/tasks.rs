// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::{collections::HashMap, sync::Mutex};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Live streaming tasks of one server, keyed by task id.
///
/// An entry exists exactly while the streaming handler behind it is still
/// producing values. The mutex is held only around map operations and token
/// firing, never across I/O.
#[derive(Default)]
pub struct TaskTable {
    inner: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: Uuid, token: CancellationToken) {
        self.inner.lock().unwrap().insert(id, token);
    }

    /// Fire the cancellation signal of `id` if it is still live.
    /// Unknown ids are a no-op (late cancels race normal completion).
    pub fn cancel(&self, id: &Uuid) -> bool {
        let guard = self.inner.lock().unwrap();
        match guard.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &Uuid) {
        self.inner.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
