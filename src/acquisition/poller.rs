//! Fixed-cadence poll loop.
//!
//! Each tick reads the whole telemetry block in one transaction. If the
//! channel reports the block unavailable the tick does nothing at all.
//! Otherwise the frame is fed to the [`ProcessTracker`], published as the
//! latest state, and enqueued for persistence only if it differs from the
//! last frame that was actually enqueued.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::frame::TelemetryFrame;
use super::tracker::{ProcessTracker, Transition};
use super::AcquisitionState;
use crate::config::PollerConfig;
use crate::hardware::{RegisterChannel, RegisterMap};
use crate::metrics::GatewayMetrics;
use crate::queue::BoundedQueue;
use crate::storage::{Record, TelemetryRecord};

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The block read was unavailable; nothing was mutated.
    Skipped,
    /// A frame was acquired.
    Polled {
        /// Whether the frame went to the acquisition queue
        enqueued: bool,
        /// Lifecycle edge caused by the frame
        transition: Option<Transition>,
    },
}

/// Sole owner of the [`ProcessTracker`] and of the acquisition state.
pub struct Poller {
    channel: Arc<RegisterChannel>,
    map: RegisterMap,
    interval: Duration,
    tracker: ProcessTracker,
    last_enqueued: Option<TelemetryFrame>,
    acquisition: Arc<BoundedQueue<Record>>,
    persistence: Arc<BoundedQueue<Record>>,
    state: watch::Sender<AcquisitionState>,
    metrics: Arc<GatewayMetrics>,
}

impl Poller {
    /// Create a poller in the Idle state with no published frame.
    pub fn new(
        channel: Arc<RegisterChannel>,
        map: RegisterMap,
        config: &PollerConfig,
        acquisition: Arc<BoundedQueue<Record>>,
        persistence: Arc<BoundedQueue<Record>>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(AcquisitionState::default());
        Self {
            channel,
            map,
            interval: config.interval,
            tracker: ProcessTracker::new(),
            last_enqueued: None,
            acquisition,
            persistence,
            state,
            metrics,
        }
    }

    /// Receiver for the published acquisition state.
    pub fn subscribe(&self) -> watch::Receiver<AcquisitionState> {
        self.state.subscribe()
    }

    /// Poll every `interval` until `shutdown` flips. A tick in progress,
    /// including its retries, runs to completion.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.interval,
            block_start = self.map.block_start(),
            block_len = self.map.block_len(),
            "Poller started"
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!(active = self.tracker.is_active(), "Poller stopped");
    }

    /// Run one poll cycle.
    pub async fn tick(&mut self) -> PollOutcome {
        GatewayMetrics::incr(&self.metrics.polls);

        let block = self
            .channel
            .read_block(self.map.block_start(), self.map.block_len())
            .await;
        let Some(frame) = block.and_then(|b| self.map.decode(&b, Utc::now())) else {
            GatewayMetrics::incr(&self.metrics.polls_skipped);
            debug!("Telemetry unavailable, skipping tick");
            return PollOutcome::Skipped;
        };

        let transition = self.tracker.observe(&frame);
        // The closing frame still belongs to the process it closed.
        let owner = match &transition {
            Some(Transition::Closed(summary)) => {
                Some((summary.process_id, summary.textile_id.clone()))
            }
            _ => self
                .tracker
                .current()
                .map(|p| (p.process_id, p.textile_id.clone())),
        };

        match &transition {
            Some(Transition::Opened(process)) => {
                GatewayMetrics::incr(&self.metrics.processes_opened);
                info!(
                    process_id = %process.process_id,
                    textile_id = %process.textile_id,
                    start_production = process.start_production,
                    start_length = process.start_length,
                    "Process opened"
                );
            }
            Some(Transition::Closed(summary)) => {
                GatewayMetrics::incr(&self.metrics.processes_closed);
                info!(
                    process_id = %summary.process_id,
                    textile_id = %summary.textile_id,
                    duration_minutes = summary.duration_minutes,
                    production_delta = summary.production_delta,
                    fabric_delta = summary.fabric_delta,
                    "Process closed"
                );
                self.persistence
                    .push(Record::ProcessSummary(summary.clone()));
            }
            None => {}
        }

        self.state.send_replace(AcquisitionState {
            frame: Some(frame.clone()),
            process: self.tracker.current().cloned(),
        });

        let changed = self
            .last_enqueued
            .as_ref()
            .map_or(true, |last| frame.differs_from(last));
        if changed {
            let (process_id, textile_id) = owner.unzip();
            self.acquisition.push(Record::Telemetry(TelemetryRecord {
                frame: frame.clone(),
                process_id,
                textile_id,
            }));
            self.last_enqueued = Some(frame);
            GatewayMetrics::incr(&self.metrics.frames_enqueued);
        }

        PollOutcome::Polled {
            enqueued: changed,
            transition,
        }
    }
}
