//! Registry of UDP replies awaiting confirmation.
//!
//! A UDP device confirms that it received a reply by sending its next datagram.
//! Until then, the reply's log entry is parked here with an armed timer.
//! Confirmation and expiry both remove the registration under the same lock,
//! so for any registration exactly one of them gets the entry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use uuid::Uuid;

use crate::log_entry::LogEntry;

/// Result of waiting on a [`TimerHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The deadline passed while the registration was still live
    Fired,
    /// The registration was removed before the deadline
    Cancelled,
}

/// Armed countdown for one registration.
///
/// The registry holds the matching sender. Removing the registration drops
/// the sender, which wakes the waiter early.
pub struct TimerHandle {
    addr: SocketAddr,
    trace_id: Uuid,
    deadline: Instant,
    cancelled: Receiver<()>,
}

impl TimerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// Block until the deadline passes or the registration is removed.
    pub fn wait(&self) -> TimerOutcome {
        match self.cancelled.recv_deadline(self.deadline) {
            Err(RecvTimeoutError::Timeout) => TimerOutcome::Fired,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => TimerOutcome::Cancelled,
        }
    }
}

struct Pending {
    entry: LogEntry,
    _cancel: Sender<()>,
}

#[derive(Default)]
struct Registry {
    pending: HashMap<SocketAddr, Pending>,
    closed: bool,
}

/// Concurrency-safe map from remote address to the entry awaiting confirmation.
pub struct TimeoutTracker {
    timeout: Duration,
    registry: Mutex<Registry>,
}

impl TimeoutTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Time a device has to send its next datagram
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Nothing panics while holding the lock, but a poisoned map is still consistent
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park `entry` for `addr` and arm its timer.
    ///
    /// If `addr` already had a registration, it is displaced and returned
    /// marked as timed out: no datagram arrived after its reply was sent.
    ///
    /// Once the tracker is closed, nothing is registered and the entry
    /// comes straight back as `Err`, marked as timed out.
    pub fn register(
        &self,
        addr: SocketAddr,
        entry: LogEntry,
    ) -> Result<(TimerHandle, Option<LogEntry>), LogEntry> {
        let mut registry = self.lock();
        if registry.closed {
            return Err(entry.into_timed_out());
        }

        let (cancel, cancelled) = bounded(0);
        let timer = TimerHandle {
            addr,
            trace_id: entry.trace_id,
            deadline: Instant::now() + self.timeout,
            cancelled,
        };

        let displaced = registry
            .pending
            .insert(
                addr,
                Pending {
                    entry,
                    _cancel: cancel,
                },
            )
            .map(|p| p.entry.into_timed_out());

        Ok((timer, displaced))
    }

    /// A new datagram arrived from `addr`: take the previous entry, if any,
    /// as confirmed and disarm its timer.
    pub fn confirm(&self, addr: SocketAddr) -> Option<LogEntry> {
        self.lock().pending.remove(&addr).map(|p| p.entry)
    }

    /// The timer for a registration fired: take its entry marked as timed out,
    /// unless a confirmation or a newer registration got there first.
    pub fn expire(&self, timer: &TimerHandle) -> Option<LogEntry> {
        let mut registry = self.lock();
        let live = registry
            .pending
            .get(&timer.addr)
            .is_some_and(|p| p.entry.trace_id == timer.trace_id);
        if !live {
            return None;
        }
        registry
            .pending
            .remove(&timer.addr)
            .map(|p| p.entry.into_timed_out())
    }

    /// Close the tracker and take every parked entry, marked as timed out.
    /// All armed timers are cancelled.
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut registry = self.lock();
        registry.closed = true;
        registry
            .pending
            .drain()
            .map(|(_, p)| p.entry.into_timed_out())
            .collect()
    }

    /// Number of replies currently awaiting confirmation
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
