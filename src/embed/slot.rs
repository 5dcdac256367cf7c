use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// One credential and its in-memory usage state.
///
/// All times are milliseconds since the owning dispatcher's epoch. Every field
/// is an atomic so concurrent batches never take a lock to pick a slot.
pub(crate) struct CredentialSlot {
    index: usize,
    credential: String,
    window_start_ms: AtomicU64,
    window_tokens: AtomicU64,
    in_flight: AtomicUsize,
    cooldown_until_ms: AtomicU64,
    consecutive_failures: AtomicU32,
    disabled: AtomicBool,
    requests: AtomicU64,
}

impl CredentialSlot {
    pub(crate) fn new(index: usize, credential: String, initial_tokens: u64) -> Self {
        Self {
            index,
            credential,
            window_start_ms: AtomicU64::new(0),
            window_tokens: AtomicU64::new(initial_tokens),
            in_flight: AtomicUsize::new(0),
            cooldown_until_ms: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            disabled: AtomicBool::new(false),
            requests: AtomicU64::new(0),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn credential(&self) -> &str {
        &self.credential
    }

    /// Tokens in the current window, resetting the window if it has elapsed.
    pub(crate) fn window_tokens(&self, now_ms: u64, window_ms: u64) -> u64 {
        let start = self.window_start_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(start) >= window_ms
            && self
                .window_start_ms
                .compare_exchange(start, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.window_tokens.store(0, Ordering::Release);
        }
        self.window_tokens.load(Ordering::Acquire)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub(crate) fn cooldown_until(&self) -> u64 {
        self.cooldown_until_ms.load(Ordering::Acquire)
    }

    pub(crate) fn is_cooling(&self, now_ms: u64) -> bool {
        self.cooldown_until() > now_ms
    }

    /// Record a dispatch of `tokens` estimated tokens.
    pub(crate) fn reserve(&self, tokens: u64) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.window_tokens.fetch_add(tokens, Ordering::AcqRel);
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn cool_down(&self, until_ms: u64) {
        self.cooldown_until_ms.fetch_max(until_ms, Ordering::AcqRel);
    }

    pub(crate) fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Count a failure; returns true if this disabled the slot.
    pub(crate) fn record_failure(&self, max_consecutive: u32) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        failures >= max_consecutive && self.disable()
    }

    /// Disable the slot; returns true if it was enabled before.
    pub(crate) fn disable(&self) -> bool {
        !self.disabled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn stats(&self, now_ms: u64, window_ms: u64) -> SlotStats {
        SlotStats {
            index: self.index,
            window_tokens: self.window_tokens(now_ms, window_ms),
            in_flight: self.in_flight(),
            cooling: self.is_cooling(now_ms),
            disabled: self.is_disabled(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            requests: self.requests.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CredentialSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSlot")
            .field("index", &self.index)
            .field("credential", &"<redacted>")
            .field("in_flight", &self.in_flight())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

/// Point-in-time view of one credential slot. Never contains the credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStats {
    /// Position in the configured credential list.
    pub index: usize,
    /// Estimated tokens in the current usage window.
    pub window_tokens: u64,
    /// Requests currently running on this slot.
    pub in_flight: usize,
    /// Whether the slot is in a rate-limit cooldown.
    pub cooling: bool,
    /// Whether the slot has been taken out of rotation.
    pub disabled: bool,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Requests dispatched since start.
    pub requests: u64,
}
