//! Periodic removal of expired security state.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;

use crate::security::gateway::GatewayHandle;

/// Background task sweeping nonces, rate windows and reputation records.
pub struct Sweeper {
    gateway: GatewayHandle,
    interval: Duration,
}

impl Sweeper {
    pub fn new(gateway: GatewayHandle, interval: Duration) -> Self {
        Self {
            gateway,
            interval: interval.max(Duration::from_secs(1)),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "State sweeper starting");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.gateway.load().sweep();
                    tracing::debug!(
                        nonces = report.nonces,
                        rate_windows = report.rate_windows,
                        reputation_records = report.reputation_records,
                        "Expired security state swept"
                    );
                }
                _ = shutdown.recv() => {
                    tracing::info!("State sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
