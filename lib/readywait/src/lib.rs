//!
//! @file lib.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Bounded, cancellable polling for an external readiness signal.
//! @bug No known bugs.
//!
//! Hook installation frequently has to wait for the host application to
//! finish unpacking or initializing before its code may be patched; the
//! classic signal is a named window appearing. This crate turns that wait
//! into an explicit condition poll with a deadline and a cancellation
//! token, so callers are never parked forever and tests never need a real
//! window.
//!

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a readiness wait ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition reported ready.
    Ready,

    /// The deadline elapsed before the condition reported ready.
    TimedOut,

    /// The wait was cancelled from another thread.
    Cancelled
}

///
/// A handle that lets any thread abandon a wait in progress.
///
/// Tokens are cheap to clone; every clone observes the same cancellation.
///
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Cancels every wait holding a clone of this token.
    pub fn cancel(
        &self
    ) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Checks whether the token has been cancelled.
    pub fn cancelled(
        &self
    ) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

///
/// Polls the given condition until it reports ready, the deadline elapses,
/// or the token is cancelled.
///
/// The condition is always checked at least once, before any sleep, so an
/// already-ready condition returns immediately. A deadline of None polls
/// until ready or cancelled; pass a token in that case or the wait is
/// unbounded.
///
pub fn wait_for(
    mut ready: impl FnMut() -> bool,
    poll: Duration,
    deadline: Option<Duration>,
    token: Option<&CancelToken>
) -> WaitOutcome {
    let start = Instant::now();

    loop {
        if token.map(|t| t.cancelled()).unwrap_or(false) {
            log::debug!("readiness wait cancelled after {:?}", start.elapsed());
            return WaitOutcome::Cancelled;
        }

        if ready() {
            return WaitOutcome::Ready;
        }

        if let Some(limit) = deadline {
            if start.elapsed() >= limit {
                log::debug!("readiness wait timed out after {:?}", limit);
                return WaitOutcome::TimedOut;
            }
        }

        std::thread::sleep(poll);
    }
}

///
/// Checks whether a top-level window of the given class exists.
///
/// This is the readiness signal packed executables usually offer: the
/// window class appears only once the real code has been unpacked and is
/// safe to patch.
///
#[cfg(windows)]
pub fn window_exists(
    class_name: &str
) -> bool {
    use windows_sys::Win32::UI::WindowsAndMessaging::FindWindowA;

    let class = match std::ffi::CString::new(class_name) {
        Ok(c) => c,
        Err(_) => return false
    };

    // SAFETY: The class name is a valid, null terminated, C string.
    unsafe { FindWindowA(class.as_ptr() as *const u8, core::ptr::null()) != 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(1);

    #[test]
    fn ready_condition_returns_immediately() {
        let out = wait_for(|| true, TICK, None, None);
        assert_eq!(out, WaitOutcome::Ready);
    }

    #[test]
    fn condition_becoming_ready_is_observed() {
        let mut polls = 0;
        let out = wait_for(
            || { polls += 1; polls >= 3 },
            TICK,
            Some(Duration::from_secs(5)),
            None
        );
        assert_eq!(out, WaitOutcome::Ready);
        assert_eq!(polls, 3);
    }

    #[test]
    fn deadline_bounds_the_wait() {
        let out = wait_for(|| false, TICK, Some(Duration::from_millis(10)), None);
        assert_eq!(out, WaitOutcome::TimedOut);
    }

    #[test]
    fn cancellation_wins_over_polling() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let handle = std::thread::spawn(move || {
            wait_for(|| false, TICK, None, Some(&waiter))
        });

        token.cancel();
        assert_eq!(handle.join().unwrap(), WaitOutcome::Cancelled);
        assert!(token.cancelled());
    }
}
