//! # Session Mutex
//!
//! A non-recursive, owner-tracked mutex enforcing the rule that a single
//! thread executes inside a session at a time. Unlike an ordinary mutex, a
//! second thread entering while another is inside fails fast with
//! [`MqError::ConcurrentAccess`] instead of queueing behind it, and an
//! unlock from a thread that does not own the mutex is reported as
//! [`MqError::ConcurrentNotOwner`] rather than silently corrupting state.
//!
//! Timed acquisition recomputes the remaining interval from a monotonic
//! clock across spurious wakeups, so a wait never times out early.

use crate::error::{MqError, MqResult};
use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// How long a blocked entry into a busy session waits for the owner to
/// leave before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout selector for [`SessionMutex::lock`] and the receive paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail immediately if the resource is unavailable.
    NoWait,
    /// Block until the resource becomes available.
    Forever,
    /// Block for at most this long.
    Timeout(Duration),
}

impl Wait {
    /// Maps the millisecond convention used across the external surface:
    /// 0 means no wait.
    pub fn from_millis(millis: u64) -> Wait {
        if millis == 0 {
            Wait::NoWait
        } else {
            Wait::Timeout(Duration::from_millis(millis))
        }
    }
}

/// Owner-tracked non-recursive mutex.
pub struct SessionMutex {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl Default for SessionMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMutex {
    pub fn new() -> Self {
        Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    /// Acquires the mutex iff it is unowned.
    ///
    /// The mutex is not recursive: a second acquisition by the owning
    /// thread is refused like any other contender.
    pub fn trylock(&self) -> MqResult<()> {
        let mut owner = self.owner.lock();
        match *owner {
            None => {
                *owner = Some(thread::current().id());
                Ok(())
            }
            Some(_) => Err(MqError::ConcurrentAccess),
        }
    }

    /// Acquires the mutex, waiting up to `wait` for the owner to leave.
    ///
    /// Returns [`MqError::ConcurrentAccess`] for a busy `NoWait` attempt
    /// and [`MqError::TimeoutExpired`] when a bounded wait elapses.
    pub fn lock(&self, wait: Wait) -> MqResult<()> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();

        let deadline = match wait {
            Wait::NoWait => None,
            Wait::Forever => None,
            Wait::Timeout(timeout) => Some(Instant::now() + timeout),
        };

        while owner.is_some() {
            match wait {
                Wait::NoWait => return Err(MqError::ConcurrentAccess),
                Wait::Forever => {
                    self.released.wait(&mut owner);
                }
                Wait::Timeout(_) => {
                    let deadline = deadline.expect("timed wait has a deadline");
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(MqError::TimeoutExpired);
                    }
                    self.released.wait_for(&mut owner, deadline - now);
                }
            }
        }

        *owner = Some(me);
        Ok(())
    }

    /// Releases the mutex; fails if the caller is not the owner.
    pub fn unlock(&self) -> MqResult<()> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if *owner == Some(me) {
            *owner = None;
            self.released.notify_all();
            Ok(())
        } else {
            Err(MqError::ConcurrentNotOwner)
        }
    }

    /// Acquires the mutex and returns a guard that releases it on drop.
    /// Every top-level session entry point goes through this.
    pub fn lock_guard(&self, wait: Wait) -> MqResult<SessionMutexGuard<'_>> {
        self.lock(wait)?;
        Ok(SessionMutexGuard { mutex: self })
    }

    /// True iff the calling thread currently owns the mutex.
    pub fn owned_by_me(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }
}

/// Scoped ownership of a [`SessionMutex`].
pub struct SessionMutexGuard<'a> {
    mutex: &'a SessionMutex,
}

impl Drop for SessionMutexGuard<'_> {
    fn drop(&mut self) {
        // The guard exists only while we own the mutex.
        let _ = self.mutex.unlock();
    }
}
