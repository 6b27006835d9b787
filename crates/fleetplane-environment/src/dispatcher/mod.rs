// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session dispatcher.
//!
//! Runs in rounds. Each round:
//! 1. moves `activating` sessions whose activation deadline passed to `error`
//! 2. fetches `creating` sessions oldest first
//! 3. handles each one in its own future, joined before the round ends:
//!    a session past its placement deadline goes to `error`; otherwise the
//!    picker proposes a process and the session is dispatched to it
//!    (assignment and process counter in one transaction)
//! 4. for each dispatched session, spawns an activation call bounded by the
//!    activation timeout; no answer in time means `error`
//!
//! A session for which no process has room stays `creating` for the next
//! round. Every `round_threshold` rounds the picker cache is cleared.

mod mock;
mod picker;

pub use mock::{ActivationMode, MockProcessClient};
pub use picker::{BusiestFirstPicker, Picker, RoundRobinPicker};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetplane_core::CoreError;
use fleetplane_core::persistence::{Persistence, ProcessRecord, SessionRecord};
use fleetplane_core::state::SessionState;
use futures::future::join_all;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cloud::CloudError;
use crate::error::Result;

/// Client for the server processes sessions are routed to.
#[async_trait]
pub trait ProcessClient: Send + Sync {
    /// Ask `process` to start hosting `session`.
    async fn activate_session(
        &self,
        process: &ProcessRecord,
        session: &SessionRecord,
    ) -> std::result::Result<(), CloudError>;
}

/// Picker strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PickerKind {
    /// Fill the busiest process first.
    #[default]
    BusiestFirst,
    /// Rotate through processes.
    RoundRobin,
}

impl PickerKind {
    /// Textual name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BusiestFirst => "busiest-first",
            Self::RoundRobin => "round-robin",
        }
    }

    /// Build the picker this kind names.
    pub fn build(self, persistence: Arc<dyn Persistence>) -> Arc<dyn Picker> {
        match self {
            Self::BusiestFirst => Arc::new(BusiestFirstPicker::new(persistence)),
            Self::RoundRobin => Arc::new(RoundRobinPicker::new(persistence)),
        }
    }
}

impl FromStr for PickerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "busiest-first" => Ok(Self::BusiestFirst),
            "round-robin" => Ok(Self::RoundRobin),
            other => Err(format!("unknown picker '{other}'")),
        }
    }
}

impl fmt::Display for PickerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Pause between rounds.
    pub poll_interval: Duration,
    /// Sessions fetched per round.
    pub batch_size: i64,
    /// Rounds between picker cache clears.
    pub round_threshold: u64,
    /// Time a process has to confirm an activation.
    pub activation_timeout: Duration,
    /// Picker strategy.
    pub picker: PickerKind,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 100,
            round_threshold: 100,
            activation_timeout: Duration::from_secs(30),
            picker: PickerKind::BusiestFirst,
        }
    }
}

/// What happened to one `creating` session in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Routed to a process, activation in progress.
    Dispatched,
    /// No process had room; try again next round.
    Waiting,
    /// Placement deadline passed.
    Expired,
}

/// Counters for one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// `activating` sessions moved to `error` by the deadline sweep.
    pub activations_expired: usize,
    /// Sessions routed to a process.
    pub dispatched: usize,
    /// Sessions left `creating`.
    pub waiting: usize,
    /// Sessions whose placement deadline passed.
    pub placement_expired: usize,
    /// Sessions whose handling failed with an error.
    pub failed: usize,
}

/// Matches pending sessions to process capacity.
pub struct Dispatcher {
    persistence: Arc<dyn Persistence>,
    picker: Arc<dyn Picker>,
    client: Arc<dyn ProcessClient>,
    config: DispatcherConfig,
    rounds: AtomicU64,
    shutdown: Arc<Notify>,
}

impl Dispatcher {
    /// Create a dispatcher using the picker named in `config`.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        client: Arc<dyn ProcessClient>,
        config: DispatcherConfig,
    ) -> Self {
        let picker = config.picker.build(persistence.clone());
        Self::with_picker(persistence, picker, client, config)
    }

    /// Create a dispatcher with an explicit picker.
    pub fn with_picker(
        persistence: Arc<dyn Persistence>,
        picker: Arc<dyn Picker>,
        client: Arc<dyn ProcessClient>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            persistence,
            picker,
            client,
            config,
            rounds: AtomicU64::new(0),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Rounds completed so far.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Run dispatch rounds until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            picker = %self.config.picker,
            "Session dispatcher started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Session dispatcher received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_round().await {
                        error!(error = %e, "Dispatch round failed");
                    }
                }
            }
        }

        info!("Session dispatcher stopped");
    }

    /// Run one dispatch round.
    pub async fn run_round(&self) -> Result<RoundReport> {
        let mut report = RoundReport {
            activations_expired: self.expire_activations().await?,
            ..RoundReport::default()
        };

        let pending = self
            .persistence
            .list_sessions_in_state(SessionState::Creating, self.config.batch_size)
            .await?;

        let placements = join_all(pending.iter().map(|session| self.place(session))).await;
        for (session, placement) in pending.iter().zip(placements) {
            match placement {
                Ok(Placement::Dispatched) => report.dispatched += 1,
                Ok(Placement::Waiting) => report.waiting += 1,
                Ok(Placement::Expired) => report.placement_expired += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(session_id = %session.session_id, error = %e, "Failed to place session");
                }
            }
        }

        let rounds = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        if rounds % self.config.round_threshold.max(1) == 0 {
            self.picker.clear_cache().await;
            debug!(rounds, "Cleared picker cache");
        }

        if report != RoundReport::default() {
            debug!(?report, "Dispatch round finished");
        }
        Ok(report)
    }

    async fn expire_activations(&self) -> Result<usize> {
        let now = Utc::now();
        let expired = self.persistence.list_expired_activations(now).await?;

        let mut moved = 0;
        for session in expired {
            if self
                .persistence
                .try_transition_session(
                    &session.session_id,
                    SessionState::Activating,
                    SessionState::Error,
                    Some("activation deadline passed"),
                    now,
                )
                .await?
            {
                warn!(session_id = %session.session_id, "Session activation deadline passed");
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn place(&self, session: &SessionRecord) -> std::result::Result<Placement, CoreError> {
        let now = Utc::now();
        if session.deadline_at <= now {
            let moved = self
                .persistence
                .try_transition_session(
                    &session.session_id,
                    SessionState::Creating,
                    SessionState::Error,
                    Some("no process became available before the placement deadline"),
                    now,
                )
                .await?;
            if moved {
                warn!(session_id = %session.session_id, fleet_id = %session.fleet_id, "Session placement deadline passed");
            }
            return Ok(Placement::Expired);
        }

        let Some(process) = self.picker.pick(&session.fleet_id).await? else {
            return Ok(Placement::Waiting);
        };

        let deadline = now
            + chrono::Duration::from_std(self.config.activation_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let dispatched = match self
            .persistence
            .dispatch_session(&session.session_id, &process.process_id, deadline, now)
            .await
        {
            Ok(dispatched) => dispatched,
            Err(e) => {
                self.picker.invalidate(&session.fleet_id).await;
                self.fail_undispatched(session, &format!("dispatch failed: {e}"), now)
                    .await;
                return Err(e);
            }
        };
        if !dispatched {
            debug!(
                session_id = %session.session_id,
                process_id = %process.process_id,
                "Process filled up before dispatch"
            );
            self.picker.invalidate(&session.fleet_id).await;
            return Ok(Placement::Waiting);
        }

        info!(
            session_id = %session.session_id,
            process_id = %process.process_id,
            "Session dispatched"
        );

        tokio::spawn(activate(
            self.persistence.clone(),
            self.client.clone(),
            process,
            session.clone(),
            self.config.activation_timeout,
        ));
        Ok(Placement::Dispatched)
    }

    /// Move a session whose dispatch write failed from `creating` to `error`.
    async fn fail_undispatched(&self, session: &SessionRecord, reason: &str, now: DateTime<Utc>) {
        match self
            .persistence
            .try_transition_session(
                &session.session_id,
                SessionState::Creating,
                SessionState::Error,
                Some(reason),
                now,
            )
            .await
        {
            Ok(true) => warn!(session_id = %session.session_id, reason, "Session failed during dispatch"),
            // The write landed after all; the activation deadline covers it
            Ok(false) => debug!(session_id = %session.session_id, "Session left 'creating' during dispatch"),
            Err(e) => {
                error!(session_id = %session.session_id, error = %e, "Failed to record dispatch failure")
            }
        }
    }
}

/// Ask the process to activate the session and record the answer.
async fn activate(
    persistence: Arc<dyn Persistence>,
    client: Arc<dyn ProcessClient>,
    process: ProcessRecord,
    session: SessionRecord,
    timeout: Duration,
) {
    let session_id = session.session_id.clone();
    let (to, reason) =
        match tokio::time::timeout(timeout, client.activate_session(&process, &session)).await {
            Ok(Ok(())) => (SessionState::Active, None),
            Ok(Err(e)) => (SessionState::Error, Some(format!("activation failed: {e}"))),
            Err(_) => (SessionState::Error, Some("activation timed out".to_string())),
        };

    match persistence
        .try_transition_session(
            &session_id,
            SessionState::Activating,
            to,
            reason.as_deref(),
            Utc::now(),
        )
        .await
    {
        Ok(true) if to == SessionState::Active => {
            info!(session_id = %session_id, process_id = %process.process_id, "Session active")
        }
        Ok(true) => {
            warn!(session_id = %session_id, reason = reason.as_deref().unwrap_or_default(), "Session activation failed")
        }
        Ok(false) => debug!(session_id = %session_id, "Session left 'activating' before the answer"),
        Err(e) => error!(session_id = %session_id, error = %e, "Failed to record activation result"),
    }
}
