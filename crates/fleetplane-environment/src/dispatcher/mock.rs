// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory process client for tests and local runs.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use fleetplane_core::persistence::{ProcessRecord, SessionRecord};

use super::ProcessClient;
use crate::cloud::CloudError;

/// How the mock answers activation requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationMode {
    /// Confirm immediately.
    Succeed,
    /// Refuse with the given message.
    Fail(String),
    /// Never answer.
    Hang,
}

/// Process client whose answers are scripted.
#[derive(Debug)]
pub struct MockProcessClient {
    mode: Mutex<ActivationMode>,
    activations: AtomicU32,
}

impl Default for MockProcessClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProcessClient {
    /// Client confirming every activation.
    pub fn new() -> Self {
        Self::with_mode(ActivationMode::Succeed)
    }

    /// Client answering with `mode`.
    pub fn with_mode(mode: ActivationMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            activations: AtomicU32::new(0),
        }
    }

    /// Change how later activations are answered.
    pub fn set_mode(&self, mode: ActivationMode) {
        if let Ok(mut current) = self.mode.lock() {
            *current = mode;
        }
    }

    /// Activation requests received.
    pub fn activations(&self) -> u32 {
        self.activations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessClient for MockProcessClient {
    async fn activate_session(
        &self,
        _process: &ProcessRecord,
        _session: &SessionRecord,
    ) -> Result<(), CloudError> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        let mode = self
            .mode
            .lock()
            .map(|mode| mode.clone())
            .unwrap_or(ActivationMode::Succeed);
        match mode {
            ActivationMode::Succeed => Ok(()),
            ActivationMode::Fail(message) => Err(CloudError::Rejected(message)),
            ActivationMode::Hang => std::future::pending().await,
        }
    }
}
