//! Per-endpoint session lifecycle.
//!
//! `SessionManager` owns at most one authenticated [`Session`]. Sessions are
//! created lazily by [`SessionManager::acquire`]; a single async gate makes
//! sure only one login runs at a time, and callers that queued behind a
//! login share its outcome instead of starting their own.
//!
//! State machine:
//!
//! ```text
//! Disconnected ──acquire──▶ Connecting ──ok──▶ Authenticated
//!      ▲                        │                  │   │
//!      └────────login failed────┘                  │   │ suspect session,
//!      └──close / invalidate / too many failures───┘   │ next acquire
//!                                Connecting ◀──────────┘
//! ```

use crate::api::ManagementApi;
use crate::config::RetryPolicy;
use crate::error::{EsxiError, EsxiResult};
use crate::types::{SessionState, SessionToken};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// One authenticated connection to an endpoint.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    token: SessionToken,
    connected_at: DateTime<Utc>,
    suspect: AtomicBool,
}

impl Session {
    fn new(token: SessionToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            token,
            connected_at: Utc::now(),
            suspect: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Flag the session as untrustworthy (e.g. a call on it timed out).
    /// The next `acquire` replaces it.
    pub fn mark_suspect(&self) {
        self.suspect.store(true, Ordering::SeqCst);
    }

    pub fn is_suspect(&self) -> bool {
        self.suspect.load(Ordering::SeqCst)
    }
}

/// Owns the session of a single endpoint.
pub struct SessionManager {
    api: Arc<dyn ManagementApi>,
    label: String,
    retry: RetryPolicy,
    max_consecutive_failures: u32,
    current: ArcSwapOption<Session>,
    state: Mutex<SessionState>,
    login_gate: tokio::sync::Mutex<()>,
    login_epoch: AtomicU64,
    last_login_error: Mutex<Option<EsxiError>>,
    consecutive_failures: AtomicU32,
}

impl SessionManager {
    pub fn new(
        api: Arc<dyn ManagementApi>,
        label: impl Into<String>,
        retry: RetryPolicy,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            api,
            label: label.into(),
            retry,
            max_consecutive_failures: max_consecutive_failures.max(1),
            current: ArcSwapOption::empty(),
            state: Mutex::new(SessionState::Disconnected),
            login_gate: tokio::sync::Mutex::new(()),
            login_epoch: AtomicU64::new(0),
            last_login_error: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn api(&self) -> &Arc<dyn ManagementApi> {
        &self.api
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != next {
            log::debug!("Session {}: {:?} -> {:?}", self.label, *state, next);
            *state = next;
        }
    }

    fn usable(&self) -> Option<Arc<Session>> {
        self.current.load_full().filter(|s| !s.is_suspect())
    }

    // ── Acquire / Release / Invalidate ──────────────────────────────

    /// Get the live session, logging in if there is none. `timeout` bounds
    /// each individual login attempt.
    pub async fn acquire(&self, timeout: Duration) -> EsxiResult<Arc<Session>> {
        if let Some(s) = self.usable() {
            return Ok(s);
        }

        let observed_epoch = self.login_epoch.load(Ordering::SeqCst);
        let _gate = self.login_gate.lock().await;

        if let Some(s) = self.usable() {
            return Ok(s);
        }
        // A login completed while we queued and it failed: report that
        // outcome rather than hammering the endpoint again.
        if self.login_epoch.load(Ordering::SeqCst) != observed_epoch {
            if let Some(err) = self.last_login_error.lock().clone() {
                return Err(err);
            }
        }

        if let Some(old) = self.current.swap(None) {
            log::info!("Session {} on {} is suspect, reconnecting", old.id(), self.label);
            self.retire(old, timeout);
        }
        self.set_state(SessionState::Connecting);

        let outcome = self.login_with_retry(timeout).await;
        match outcome {
            Ok(token) => {
                let session = Arc::new(Session::new(token));
                self.current.store(Some(session.clone()));
                *self.last_login_error.lock() = None;
                self.login_epoch.fetch_add(1, Ordering::SeqCst);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.set_state(SessionState::Authenticated);
                log::info!("Session {} established on {}", session.id(), self.label);
                Ok(session)
            }
            Err(e) => {
                *self.last_login_error.lock() = Some(e.clone());
                self.login_epoch.fetch_add(1, Ordering::SeqCst);
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Hand a session back after a successful call.
    pub fn release(&self, session: Arc<Session>) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        drop(session);
    }

    /// Drop `session` if it is still the current one and log it out in the
    /// background.
    pub fn invalidate(&self, session: &Session) {
        let current = self.current.load_full();
        if current.as_ref().map(|s| s.id()) != Some(session.id()) {
            return;
        }
        if let Some(old) = self.current.swap(None) {
            log::info!("Invalidating session {} on {}", old.id(), self.label);
            self.set_state(SessionState::Disconnected);
            self.retire(old, Duration::from_secs(5));
        }
    }

    /// Record a failed call made with `session`. Connection-class errors
    /// make the session suspect; after `max_consecutive_failures` in a row
    /// the session is torn down. Returns `true` when it was torn down.
    pub fn record_failure(&self, session: &Session, err: &EsxiError) -> bool {
        if err.is_connection_failure() {
            session.mark_suspect();
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.max_consecutive_failures {
            log::warn!(
                "{} consecutive failures on {}, tearing session down (last: {})",
                failures,
                self.label,
                err
            );
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.invalidate(session);
            return true;
        }
        false
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    // ── Keep-alive / shutdown ───────────────────────────────────────

    /// Probe the current session. Returns `false` (and drops the session)
    /// when the endpoint no longer accepts it, or when there is none.
    pub async fn check_alive(&self, timeout: Duration) -> bool {
        let Some(session) = self.current.load_full() else {
            return false;
        };
        let alive = match tokio::time::timeout(timeout, self.api.check_session(session.token())).await {
            Ok(Ok(alive)) => alive,
            Ok(Err(e)) => {
                log::debug!("Keep-alive on {} failed: {}", self.label, e);
                false
            }
            Err(_) => false,
        };
        if !alive {
            self.invalidate(&session);
        }
        alive
    }

    /// Log out and forget the session.
    pub async fn close(&self, timeout: Duration) {
        let _gate = self.login_gate.lock().await;
        if let Some(session) = self.current.swap(None) {
            match tokio::time::timeout(timeout, self.api.logout(session.token())).await {
                Ok(Ok(())) => log::info!("Logged out of {}", self.label),
                Ok(Err(e)) => log::debug!("Logout from {} failed: {}", self.label, e),
                Err(_) => log::debug!("Logout from {} timed out", self.label),
            }
        }
        self.set_state(SessionState::Disconnected);
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn login_with_retry(&self, timeout: Duration) -> EsxiResult<SessionToken> {
        let attempts = self.retry.attempts();
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(timeout, self.api.login()).await {
                Ok(r) => r,
                Err(_) => Err(EsxiError::timeout(format!(
                    "Login to {} timed out after {:?}",
                    self.label, timeout
                ))),
            };

            match result {
                Ok(token) => return Ok(token),
                Err(e) if e.is_connection_failure() && attempt + 1 < attempts => {
                    let delay = self.retry.backoff(attempt);
                    log::warn!(
                        "Login to {} failed (attempt {}/{}): {} - retrying in {}ms",
                        self.label,
                        attempt + 1,
                        attempts,
                        e.message,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_connection_failure() => {
                    log::error!("{} unreachable after {} attempts: {}", self.label, attempts, e.message);
                    return Err(EsxiError::connection(format!(
                        "{} unreachable after {} attempts: {}",
                        self.label, attempts, e.message
                    )));
                }
                Err(e) => {
                    log::error!("Login to {} failed: {}", self.label, e);
                    return Err(e);
                }
            }
        }
    }

    /// Best-effort background logout of a session that is no longer used.
    fn retire(&self, session: Arc<Session>, timeout: Duration) {
        let api = self.api.clone();
        let label = self.label.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, api.logout(session.token())).await {
                Ok(Ok(())) => log::debug!("Retired session {} on {}", session.id(), label),
                Ok(Err(e)) => log::debug!("Retiring session {} on {} failed: {}", session.id(), label, e),
                Err(_) => log::debug!("Retiring session {} on {} timed out", session.id(), label),
            }
        });
    }
}
