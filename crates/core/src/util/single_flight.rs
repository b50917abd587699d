//! Last-issued-wins guard for asynchronous operations of one kind.
//!
//! Every operation takes a [`Ticket`] when it is issued. When it resolves,
//! [`SingleFlight::complete`] applies its result only if no newer ticket has
//! been issued (and nothing invalidated it) in the meantime. The check and
//! the apply run under the same lock as `issue`, so a newer operation can
//! never be overwritten by an older one that resolves later.

use std::sync::{Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl Ticket {
    pub fn generation(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct SingleFlight {
    latest: Mutex<u64>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        match self.latest.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("single-flight lock was poisoned; recovering and continuing");
                poisoned.into_inner()
            }
        }
    }

    /// Issues a ticket that supersedes every earlier one.
    pub fn issue(&self) -> Ticket {
        let mut latest = self.lock();
        *latest += 1;
        Ticket(*latest)
    }

    pub fn is_current(&self, ticket: Ticket) -> bool {
        *self.lock() == ticket.0
    }

    /// Supersedes every outstanding ticket without issuing a new one.
    pub fn invalidate(&self) {
        *self.lock() += 1;
    }

    /// Runs `apply` if `ticket` is still the latest, returning its result.
    pub fn complete<R>(&self, ticket: Ticket, apply: impl FnOnce() -> R) -> Option<R> {
        let latest = self.lock();
        if *latest != ticket.0 {
            return None;
        }
        let out = apply();
        drop(latest);
        Some(out)
    }
}
