//! Watchdog timers bounding each operational phase
//!
//! A watchdog never touches device state itself. When it expires it posts a
//! [`WatchdogExpiry`] on the manager's channel and the manager task decides whether the
//! expiry still applies.

use crate::error::TxRxError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Bounded operational step guarded by a watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Scan,
    Connect,
    Disconnect,
    Send,
    Receive,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Scan,
        Phase::Connect,
        Phase::Disconnect,
        Phase::Send,
        Phase::Receive,
    ];

    /// Configuration key of this phase
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Scan => "scan",
            Phase::Connect => "connect",
            Phase::Disconnect => "disconnect",
            Phase::Send => "send",
            Phase::Receive => "receive",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = TxRxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| TxRxError::InvalidParameters(format!("Unknown timeout phase: {}", s)))
    }
}

/// Lifecycle of one arming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Armed,
    Fired,
    Cancelled,
}

/// Message posted to the manager when a watchdog expires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogExpiry {
    pub timer_id: u64,
    /// Indexed name of the guarded device, `None` for the scan watchdog
    pub device: Option<String>,
    pub phase: Phase,
}

/// Single-shot cancellable deadline
///
/// Dropping a timer cancels it, so replacing a device's watchdog implicitly cancels the
/// previous arming.
pub struct WatchdogTimer {
    id: u64,
    device: Option<String>,
    phase: Phase,
    interval: Duration,
    state: Arc<Mutex<WatchdogState>>,
    task: JoinHandle<()>,
}

impl WatchdogTimer {
    /// Arm a watchdog; it starts counting immediately
    pub fn schedule(
        device: Option<String>,
        phase: Phase,
        interval: Duration,
        expiry_tx: mpsc::UnboundedSender<WatchdogExpiry>,
    ) -> Self {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(Mutex::new(WatchdogState::Armed));
        let deadline = Instant::now() + interval;

        let task = tokio::spawn({
            let state = Arc::clone(&state);
            let expiry = WatchdogExpiry {
                timer_id: id,
                device: device.clone(),
                phase,
            };
            async move {
                tokio::time::sleep_until(deadline).await;
                {
                    let mut state = state.lock();
                    if *state != WatchdogState::Armed {
                        return;
                    }
                    *state = WatchdogState::Fired;
                }
                // Manager gone: nobody left to time out
                let _ = expiry_tx.send(expiry);
            }
        });

        Self {
            id,
            device,
            phase,
            interval,
            state,
            task,
        }
    }

    /// Cancel the timer; no-op once fired or cancelled
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if *state == WatchdogState::Armed {
            *state = WatchdogState::Cancelled;
            self.task.abort();
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> WatchdogState {
        *self.state.lock()
    }
}

impl Drop for WatchdogTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for WatchdogTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchdogTimer")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("phase", &self.phase)
            .field("interval", &self.interval)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(500);

    #[test]
    fn test_phase_parse() {
        assert_eq!("connect".parse::<Phase>().expect("Phase"), Phase::Connect);
        assert_eq!(" Receive ".parse::<Phase>().expect("Phase"), Phase::Receive);
        assert!("bogus".parse::<Phase>().is_err());
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().expect("Phase"), phase);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_exactly_once_after_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = WatchdogTimer::schedule(Some("D1".to_string()), Phase::Send, INTERVAL, tx);

        tokio::time::sleep(INTERVAL - Duration::from_millis(1)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(timer.state(), WatchdogState::Armed);

        let expiry = rx.recv().await.expect("Expiry");
        assert_eq!(expiry.timer_id, timer.id());
        assert_eq!(expiry.device.as_deref(), Some("D1"));
        assert_eq!(expiry.phase, Phase::Send);
        assert_eq!(timer.state(), WatchdogState::Fired);

        tokio::time::sleep(INTERVAL * 10).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = WatchdogTimer::schedule(None, Phase::Scan, INTERVAL, tx);

        timer.cancel();
        timer.cancel();
        tokio::time::sleep(INTERVAL * 2).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(timer.state(), WatchdogState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_noop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = WatchdogTimer::schedule(None, Phase::Scan, INTERVAL, tx);

        rx.recv().await.expect("Expiry");
        timer.cancel();
        assert_eq!(timer.state(), WatchdogState::Fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = WatchdogTimer::schedule(Some("D1".to_string()), Phase::Receive, INTERVAL, tx.clone());
        let first_id = first.id();
        drop(first);

        let second = WatchdogTimer::schedule(Some("D1".to_string()), Phase::Receive, INTERVAL * 2, tx);
        let expiry = rx.recv().await.expect("Expiry");
        assert_ne!(expiry.timer_id, first_id);
        assert_eq!(expiry.timer_id, second.id());
    }
}
