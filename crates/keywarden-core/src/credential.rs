//! In-process cache of the live managed credential.
//!
//! Every remote call authenticates with the value held here. The cache is
//! updated in the same operation that persists a new key to disk, so calls
//! made after a rotation always carry the fresh value regardless of how the
//! key was originally sourced (state file or environment override).

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use secrecy::{ExposeSecret, SecretString};

/// Shared, mutable handle to the current credential value.
#[derive(Debug)]
pub struct CredentialCache {
    value: RwLock<SecretString>,
    stale: AtomicBool,
}

impl CredentialCache {
    /// Creates a cache holding `initial`.
    #[must_use]
    pub fn new(initial: SecretString) -> Self {
        Self {
            value: RwLock::new(initial),
            stale: AtomicBool::new(false),
        }
    }

    /// Returns a copy of the current credential.
    ///
    /// # Panics
    ///
    /// Panics if the inner lock is poisoned, which cannot happen because no
    /// writer panics while holding it.
    #[must_use]
    pub fn current(&self) -> SecretString {
        let guard = self.value.read().expect("credential lock poisoned");
        SecretString::from(guard.expose_secret().to_owned())
    }

    /// Replaces the credential and clears the stale flag.
    ///
    /// # Panics
    ///
    /// Panics if the inner lock is poisoned.
    pub fn replace(&self, value: SecretString) {
        let mut guard = self.value.write().expect("credential lock poisoned");
        *guard = value;
        self.stale.store(false, Ordering::SeqCst);
    }

    /// Marks the credential stale. Set when the authority rejects it;
    /// observable via agent status.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Whether the authority has rejected the current value.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }
}
