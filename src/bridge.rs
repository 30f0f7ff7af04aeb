//! Bridges event-driven completion onto blocking callers.
//!
//! Long-running protocol exchanges (attach, survey, refresh, reset, i2c
//! request) complete when a matching response is decoded on the drain thread.
//! Callers either hand in their own [`Signal`] and return immediately, or
//! pass `None` and block until the completion fires or a timeout elapses.

use std::sync::mpsc;
use std::time::Duration;

use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::errors::Error;

/// A one-shot completion notification.
///
/// Fired exactly once by the drain thread when the operation it was attached
/// to finishes.
pub type Signal = Box<dyn FnOnce() + Send + 'static>;

/// Runs `start` with a completion [`Signal`] and optionally blocks on it.
///
/// With `Some(signal)` the caller keeps control: `start` receives the signal
/// and this function returns as soon as `start` does. With `None` a signal is
/// wired to an internal channel and the call blocks until it fires, up to
/// `timeout`.
///
/// A completion firing after the caller has already timed out is harmless:
/// the send lands on a disconnected channel and is ignored.
pub fn invoke<F>(timeout: Duration, signal: Option<Signal>, start: F) -> Result<(), Error>
where
    F: FnOnce(Signal) -> Result<(), Error>,
{
    match signal {
        Some(signal) => start(signal),
        None => {
            let (sender, receiver) = mpsc::sync_channel::<()>(1);
            start(Box::new(move || {
                let _ = sender.send(());
            }))?;
            match receiver.recv_timeout(timeout) {
                Ok(()) => Ok(()),
                Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::Timeout {
                    after_ms: timeout.as_millis() as u64,
                }),
                // The signal was dropped without firing: the operation was
                // abandoned (detach, engine teardown).
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::WouldBlock),
            }
        }
    }
}

/// A bounded-wait mutual exclusion gate.
///
/// Serializes refresh cycles: a second refresh started while one is in flight
/// waits up to the configured timeout, then proceeds anyway (contention here
/// is a liveness concern, not a correctness one, and is only logged).
#[derive(Debug, Default)]
pub struct Gate {
    held: Mutex<bool>,
    freed: Condvar,
}

impl Gate {
    /// Takes the gate, waiting up to `timeout` for the current holder.
    ///
    /// Returns `false` when the wait expired and the gate was taken over
    /// regardless.
    pub fn acquire(&self, timeout: Duration) -> bool {
        let mut held = self.held.lock();
        let mut clean = true;
        if *held {
            let result = self.freed.wait_while_for(&mut held, |held| *held, timeout);
            if result.timed_out() && *held {
                warn!("gate takeover after {:?} wait", timeout);
                clean = false;
            }
        }
        *held = true;
        clean
    }

    /// Frees the gate and wakes one waiter.
    pub fn release(&self) {
        let mut held = self.held.lock();
        *held = false;
        self.freed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_invoke_with_signal_never_blocks() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let result = invoke(
            Duration::from_millis(1),
            Some(Box::new(|| {})),
            move |_signal| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
        );
        assert!(result.is_ok());
        assert!(started.load(Ordering::SeqCst));
    }

    #[test]
    fn test_invoke_with_signal_propagates_start_error() {
        let result = invoke(Duration::from_millis(1), Some(Box::new(|| {})), |_signal| {
            Err(Error::Unsupported {
                operation: "set_clock",
            })
        });
        assert!(matches!(result, Err(Error::Unsupported { .. })));
    }

    #[test]
    fn test_invoke_blocking_completes() {
        let result = invoke(Duration::from_millis(100), None, |signal| {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                signal();
            });
            Ok(())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn test_invoke_blocking_times_out() {
        let start = Instant::now();
        let result = invoke(Duration::from_millis(10), None, |signal| {
            // Keep the signal alive past the wait so the channel does not
            // disconnect before the timeout.
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(200));
                signal();
            });
            Ok(())
        });
        assert!(matches!(result, Err(Error::Timeout { after_ms: 10 })));
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn test_invoke_blocking_dropped_signal() {
        let result = invoke(Duration::from_millis(100), None, |signal| {
            drop(signal);
            Ok(())
        });
        assert!(matches!(result, Err(Error::WouldBlock)));
    }

    #[test]
    fn test_gate_uncontended() {
        let gate = Gate::default();
        assert!(gate.acquire(Duration::from_millis(1)));
        gate.release();
        assert!(gate.acquire(Duration::from_millis(1)));
    }

    #[test]
    fn test_gate_takeover_after_timeout() {
        let gate = Gate::default();
        assert!(gate.acquire(Duration::from_millis(1)));
        // Second acquisition times out but still proceeds.
        assert!(!gate.acquire(Duration::from_millis(5)));
    }

    #[test]
    fn test_gate_handover() {
        let gate = Arc::new(Gate::default());
        assert!(gate.acquire(Duration::from_millis(1)));

        let clone = gate.clone();
        let waiter = std::thread::spawn(move || clone.acquire(Duration::from_millis(500)));
        std::thread::sleep(Duration::from_millis(10));
        gate.release();
        assert!(waiter.join().unwrap());
    }
}
