//! Cooperative cancellation for evaluation jobs.
//!
//! A [`CancellationToken`] is a shared flag checked by the search between simulation batches.
//! [`SingleFlight`] owns the tokens of every registered evaluation request and guarantees that at
//! most one of them is live: registering a new request cancels all older ones.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelReason {
    /// The caller asked for it via `cancelEvaluation`.
    Requested,
    /// A newer evaluation for the same engine took over.
    Superseded,
    /// The engine instance was replaced by `init` or dropped.
    EngineReplaced,
}

impl CancelReason {
    const fn to_u8(self) -> u8 {
        match self {
            CancelReason::Requested => 1,
            CancelReason::Superseded => 2,
            CancelReason::EngineReplaced => 3,
        }
    }

    const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(CancelReason::Requested),
            2 => Some(CancelReason::Superseded),
            3 => Some(CancelReason::EngineReplaced),
            _ => None,
        }
    }

    /// Whether the caller that issued the cancelled request should see it as a failure.
    pub fn is_error_for_caller(self) -> bool {
        matches!(self, CancelReason::EngineReplaced)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    reason: Arc<AtomicU8>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the token. The first reason wins; later calls return `false`.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.reason
            .compare_exchange(0, reason.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason.load(Ordering::Acquire) != 0
    }

    pub fn reason(&self) -> Option<CancelReason> {
        CancelReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    fn cancelled(reason: CancelReason) -> Self {
        let token = Self::new();
        token.cancel(reason);
        token
    }
}

/// Registry of evaluation tokens keyed by request id.
#[derive(Debug, Default)]
pub struct SingleFlight {
    flights: Mutex<HashMap<u64, CancellationToken>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, CancellationToken>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `request_id` as the newest evaluation, cancelling every older one.
    pub fn begin(&self, request_id: u64) -> CancellationToken {
        let mut flights = self.lock();
        for token in flights.values() {
            token.cancel(CancelReason::Superseded);
        }
        let token = CancellationToken::new();
        flights.insert(request_id, token.clone());
        token
    }

    /// Token for a registered request. Unknown ids were superseded before they were registered
    /// (or never were), so they come back already cancelled.
    pub fn token_for(&self, request_id: u64) -> CancellationToken {
        self.lock()
            .get(&request_id)
            .cloned()
            .unwrap_or_else(|| CancellationToken::cancelled(CancelReason::Superseded))
    }

    pub fn finish(&self, request_id: u64) {
        self.lock().remove(&request_id);
    }

    /// Cancel every live evaluation. Returns how many tokens were flipped by this call; zero is
    /// a valid outcome.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        self.lock()
            .values()
            .filter(|token| token.cancel(reason))
            .count()
    }

    /// Cancel live evaluations registered under an id lower than `request_id`. Ids grow with
    /// submission order, so a control request never reaches evaluations queued behind it.
    pub fn cancel_before(&self, request_id: u64, reason: CancelReason) -> usize {
        self.lock()
            .iter()
            .filter(|(&id, token)| id < request_id && token.cancel(reason))
            .count()
    }

    pub fn is_active(&self) -> bool {
        self.lock().values().any(|token| !token.is_cancelled())
    }
}
