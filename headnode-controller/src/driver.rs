// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs reconciliation passes periodically

use crate::controller::HeadnodeController;
use crate::controller::PassSummary;
use chrono::DateTime;
use chrono::Utc;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;

/// Most recent pass, as published by the [`Driver`].
#[derive(Clone, Debug, Default)]
pub struct DriverStatus {
    /// Number of passes completed.
    pub iteration: u64,
    pub last: Option<LastPass>,
}

#[derive(Clone, Debug)]
pub struct LastPass {
    pub start_time: DateTime<Utc>,
    pub elapsed: Duration,
    pub summary: PassSummary,
}

/// Invokes [`HeadnodeController::reconcile_once`] every `period`.
///
/// Passes never overlap: a pass that runs long delays the next one rather
/// than queueing up more.
pub struct Driver {
    log: Logger,
    controller: HeadnodeController,
    period: Duration,
    status_tx: watch::Sender<DriverStatus>,
}

impl Driver {
    pub fn new(
        log: &Logger,
        controller: HeadnodeController,
        period: Duration,
    ) -> Driver {
        let (status_tx, _) = watch::channel(DriverStatus::default());
        Driver {
            log: log.new(o!("component" => "Driver")),
            controller,
            period,
            status_tx,
        }
    }

    /// Returns a channel that is updated after every pass.
    pub fn status(&self) -> watch::Receiver<DriverStatus> {
        self.status_tx.subscribe()
    }

    /// Runs passes until `shutdown` completes, then stops any configuration
    /// runs still in flight.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(self.log, "driver started"; "period" => ?self.period);
        loop {
            tokio::select! {
                _ = interval.tick() => self.activate().await,
                _ = &mut shutdown => break,
            }
        }

        info!(self.log, "shutting down");
        self.controller.shutdown().await;
    }

    async fn activate(&mut self) {
        let iteration = self.status_tx.borrow().iteration + 1;
        let start_time = Utc::now();
        let start_instant = Instant::now();
        debug!(self.log, "activating"; "iteration" => iteration);

        let summary = self.controller.reconcile_once().await;

        let elapsed = start_instant.elapsed();
        debug!(
            self.log,
            "activation complete";
            "elapsed" => ?elapsed,
            "iteration" => iteration,
        );
        self.status_tx.send_replace(DriverStatus {
            iteration,
            last: Some(LastPass { start_time, elapsed, summary }),
        });
    }
}
