//! Start/stop/tick skeleton shared by the background loops.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Shortest accepted period; `interval_at` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// One unit of periodic work.
#[async_trait]
pub trait Cycle: Send + 'static {
  fn name(&self) -> &'static str;

  async fn run_cycle(&mut self);
}

/// A cycle running on its own tokio task.
///
/// Cycles never overlap: a tick that fires while a cycle is running is
/// skipped. Stopping is honored only between cycles.
pub struct PeriodicTask<C> {
  shutdown: watch::Sender<bool>,
  handle: JoinHandle<C>,
}

impl<C: Cycle> PeriodicTask<C> {
  /// Spawn the loop. The first cycle runs after `initial_delay`. Periods
  /// shorter than a millisecond are raised to one.
  pub fn spawn(mut cycle: C, period: Duration, initial_delay: Duration) -> Self {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let period = period.max(MIN_PERIOD);

    let handle = tokio::spawn(async move {
      let mut ticker = interval_at(Instant::now() + initial_delay, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

      info!(
        task = cycle.name(),
        interval_ms = period.as_millis() as u64,
        "periodic task started"
      );

      loop {
        tokio::select! {
          changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
              break;
            }
          }

          _ = ticker.tick() => {
            debug!(task = cycle.name(), "cycle starting");
            cycle.run_cycle().await;
          }
        }
      }

      info!(task = cycle.name(), "periodic task stopped");
      cycle
    });

    Self { shutdown, handle }
  }

  /// Signal the loop and wait for the in-progress cycle to finish.
  /// Returns the cycle for inspection.
  pub async fn stop(self) -> Result<C> {
    // The receiver is gone only if the task already ended
    let _ = self.shutdown.send(true);
    self
      .handle
      .await
      .map_err(|e| eyre!("Periodic task failed: {}", e))
  }

  pub fn is_finished(&self) -> bool {
    self.handle.is_finished()
  }
}
