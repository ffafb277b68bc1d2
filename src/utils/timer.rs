//! Coarse-grained timer built from a spawned sleeper task connected to the
//! caller through `tokio::sync::watch` and `tokio::sync::Notify`. Suitable
//! for protocol-level timeouts (group check, lease, learn retry), not for
//! fine-grained pacing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::utils::ReplicoreError;

use futures::future::FutureExt;

use tokio::sync::{watch, Notify};
use tokio::time::{self, Duration, Instant};

/// Timer that signals once after a kicked-off duration. Re-kicking before the
/// deadline restarts the countdown, which is how incremental backoff is done.
/// Must be used within a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Deadline setting channel (caller side sender).
    deadline_tx: watch::Sender<Option<Instant>>,

    /// Timeout notification channel (caller side receiver).
    notify: Arc<Notify>,

    /// Set when the active deadline has fired and not been re-armed since.
    exploded: Arc<AtomicBool>,
}

impl Timer {
    /// Creates a new timer and spawns its background sleeper task. The task
    /// terminates when the `Timer` value is dropped. If `explode_action` is
    /// given, it runs on every firing in addition to the notification.
    pub fn new<F>(explode_action: Option<F>) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (deadline_tx, mut deadline_rx) = watch::channel(None);
        let notify = Arc::new(Notify::new());
        let notify_ref = notify.clone();
        let exploded = Arc::new(AtomicBool::new(false));
        let exploded_ref = exploded.clone();

        tokio::spawn(async move {
            let sleep = time::sleep(Duration::ZERO);
            tokio::pin!(sleep);

            while deadline_rx.changed().await.is_ok() {
                let deadline = *deadline_rx.borrow();
                if let Some(ddl) = deadline {
                    sleep.as_mut().reset(ddl);
                    (&mut sleep).await;

                    // swallow the firing if the deadline moved while asleep
                    if let Ok(false) = deadline_rx.has_changed() {
                        exploded_ref.store(true, Ordering::Release);
                        if let Some(action) = explode_action.as_ref() {
                            action();
                        }
                        notify_ref.notify_one();
                    }
                }
            }
            // sender dropped, sleeper terminates
        });

        Timer {
            deadline_tx,
            notify,
            exploded,
        }
    }

    /// Arms the timer for the given duration, overriding any deadline that is
    /// currently pending.
    pub fn kickoff(&self, dur: Duration) -> Result<(), ReplicoreError> {
        if dur.is_zero() {
            return Err(ReplicoreError::msg("invalid zero timeout duration"));
        }

        self.exploded.store(false, Ordering::Release);
        self.deadline_tx.send(Some(Instant::now() + dur))?;
        Ok(())
    }

    /// Disarms the timer and consumes any firing already delivered.
    pub fn cancel(&self) -> Result<(), ReplicoreError> {
        self.deadline_tx.send(None)?;
        self.exploded.store(false, Ordering::Release);

        while self.notify.notified().now_or_never().is_some() {}

        Ok(())
    }

    /// True if the last armed deadline has fired without being re-armed or
    /// cancelled since.
    pub fn exploded(&self) -> bool {
        self.exploded.load(Ordering::Acquire)
    }

    /// Waits for the next firing; intended as a `tokio::select!` branch.
    pub async fn timeout(&self) {
        self.notify.notified().await;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new::<fn()>(None)
    }
}
