//! Gate, backlog and the single sequential defect worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use super::{admit, reset_defect_flag, DefectEvent, DefectRecord};
use crate::acquisition::AcquisitionState;
use crate::config::DefectConfig;
use crate::error::{GatewayError, GatewayResult, RejectReason};
use crate::hardware::RegisterChannel;
use crate::metrics::GatewayMetrics;
use crate::queue::BoundedQueue;
use crate::storage::Record;

/// Build the submission handle and its worker. The worker must be spawned
/// for accepted events to be processed.
pub fn defect_funnel(
    config: &DefectConfig,
    backlog: usize,
    state: watch::Receiver<AcquisitionState>,
    channel: Arc<RegisterChannel>,
    flag_address: u16,
    persistence: Arc<BoundedQueue<Record>>,
    metrics: Arc<GatewayMetrics>,
) -> (DefectFunnel, DefectWorker) {
    let (tx, rx) = mpsc::channel(backlog.max(1));
    let funnel = DefectFunnel {
        tx,
        state: state.clone(),
        metrics: Arc::clone(&metrics),
    };
    let worker = DefectWorker {
        rx,
        state,
        channel,
        flag_address,
        hold: config.hold,
        persistence,
        metrics,
    };
    (funnel, worker)
}

/// Submission side of the funnel. Cheap to clone.
#[derive(Clone)]
pub struct DefectFunnel {
    tx: mpsc::Sender<DefectEvent>,
    state: watch::Receiver<AcquisitionState>,
    metrics: Arc<GatewayMetrics>,
}

impl DefectFunnel {
    /// Gate an event and queue it for the worker.
    ///
    /// Never waits: a full backlog is a rejection, not backpressure on the
    /// inspection subsystem.
    pub fn submit(&self, event: DefectEvent) -> GatewayResult<()> {
        let verdict = admit(&self.state.borrow()).map(|_| ());
        if let Err(reason) = verdict {
            return Err(self.reject(&event, reason));
        }

        match self.tx.try_send(event) {
            Ok(()) => {
                GatewayMetrics::incr(&self.metrics.defects_accepted);
                debug!(pending = self.pending(), "Defect event accepted");
                Ok(())
            }
            Err(TrySendError::Full(event)) => Err(self.reject(&event, RejectReason::Backlogged)),
            Err(TrySendError::Closed(event)) => {
                Err(self.reject(&event, RejectReason::ShuttingDown))
            }
        }
    }

    /// Events accepted but not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    fn reject(&self, event: &DefectEvent, reason: RejectReason) -> GatewayError {
        GatewayMetrics::incr(&self.metrics.defects_rejected);
        info!(detection_id = %event.detection_id, %reason, "Defect event rejected");
        GatewayError::GateRejection(reason)
    }
}

/// The one consumer of the defect backlog.
pub struct DefectWorker {
    rx: mpsc::Receiver<DefectEvent>,
    state: watch::Receiver<AcquisitionState>,
    channel: Arc<RegisterChannel>,
    flag_address: u16,
    hold: Duration,
    persistence: Arc<BoundedQueue<Record>>,
    metrics: Arc<GatewayMetrics>,
}

impl DefectWorker {
    /// Process events one at a time until `shutdown` flips or every
    /// [`DefectFunnel`] is dropped. An event being processed is finished.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(hold = ?self.hold, flag_address = self.flag_address, "Defect worker started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = self.rx.recv() => match event {
                    Some(event) => {
                        self.process(event).await;
                    }
                    None => break,
                },
            }
        }
        info!("Defect worker stopped");
    }

    /// Re-validate, pulse the defect flag and record the event.
    ///
    /// The process and `length_at_detection` always come from the same
    /// state: the one published after the pulse while the admitted process is
    /// still open, otherwise the state the event was re-validated against.
    ///
    /// Returns `None` if the gate no longer admits the event.
    #[instrument(skip(self, event), fields(detection_id = %event.detection_id))]
    pub async fn process(&mut self, event: DefectEvent) -> Option<DefectRecord> {
        // State may have changed since the event was accepted.
        let admitted = {
            let state = self.state.borrow();
            admit(&state).map(|process| (process.clone(), fabric_length(&state)))
        };
        let (process, admitted_length) = match admitted {
            Ok(admitted) => admitted,
            Err(reason) => {
                GatewayMetrics::incr(&self.metrics.defects_rejected);
                info!(%reason, "Defect event no longer admissible, dropped");
                return None;
            }
        };

        let asserted = self.channel.write_register(self.flag_address, 1).await;
        if asserted {
            sleep(self.hold).await;
            if !self.channel.write_register(self.flag_address, 0).await {
                GatewayMetrics::incr(&self.metrics.pulse_failures);
                error!(address = self.flag_address, "Defect flag deassert failed");
                reset_defect_flag(&self.channel, self.flag_address).await;
            }
        } else {
            GatewayMetrics::incr(&self.metrics.pulse_failures);
            warn!(address = self.flag_address, "Defect flag assert failed, recording without pulse");
        }

        let length_at_detection = {
            let state = self.state.borrow();
            match &state.process {
                Some(open) if open.process_id == process.process_id => fabric_length(&state),
                _ => {
                    debug!(process_id = %process.process_id, "Process closed during pulse");
                    admitted_length
                }
            }
        };

        let record = DefectRecord {
            detection_id: event.detection_id,
            process_id: process.process_id,
            textile_id: process.textile_id,
            count: event.count,
            confidence: event.confidence,
            arrival_time: event.arrival_time,
            processed_at: Utc::now(),
            length_at_detection,
            pulse_acknowledged: asserted,
        };
        GatewayMetrics::incr(&self.metrics.defects_processed);
        info!(
            textile_id = %record.textile_id,
            length_at_detection,
            pulse_acknowledged = asserted,
            "Defect recorded"
        );
        self.persistence.push(Record::Defect(record.clone()));
        Some(record)
    }
}

fn fabric_length(state: &AcquisitionState) -> u32 {
    state.frame.as_ref().map_or(0, |frame| frame.fabric_length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::frame::tests::frame;
    use crate::acquisition::ProcessTracker;
    use crate::config::LinkConfig;
    use crate::hardware::simulator::{Op, SimulatedController};
    use crate::retry::RetryPolicy;

    const FLAG: u16 = 6;

    fn active(running: bool, length: u32) -> AcquisitionState {
        let mut tracker = ProcessTracker::new();
        let mut f = frame(true, 0, length);
        f.machine_running = running;
        tracker.observe(&f);
        AcquisitionState {
            frame: Some(f),
            process: tracker.current().cloned(),
        }
    }

    struct Rig {
        sim: SimulatedController,
        state: watch::Sender<AcquisitionState>,
        persistence: Arc<BoundedQueue<Record>>,
        metrics: Arc<GatewayMetrics>,
        funnel: DefectFunnel,
        worker: DefectWorker,
    }

    async fn rig(initial: AcquisitionState, backlog: usize) -> Rig {
        let sim = SimulatedController::new(16);
        let metrics = Arc::new(GatewayMetrics::default());
        let link = LinkConfig {
            io: RetryPolicy::new(3, Duration::from_millis(100)),
            io_timeout: Duration::from_millis(500),
            ..LinkConfig::default()
        };
        let channel = Arc::new(RegisterChannel::new(
            Box::new(sim.clone()),
            &link,
            metrics.clone(),
        ));
        channel.connect().await.unwrap();
        let (state, state_rx) = watch::channel(initial);
        let persistence = Arc::new(BoundedQueue::new("persistence", 16));
        let (funnel, worker) = defect_funnel(
            &DefectConfig {
                hold: Duration::from_millis(500),
            },
            backlog,
            state_rx,
            channel,
            FLAG,
            persistence.clone(),
            metrics.clone(),
        );
        Rig {
            sim,
            state,
            persistence,
            metrics,
            funnel,
            worker,
        }
    }

    fn defects(queue: &BoundedQueue<Record>) -> Vec<DefectRecord> {
        queue
            .snapshot()
            .into_iter()
            .filter_map(|r| match r {
                Record::Defect(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_pulses_never_interleave() {
        let rig = rig(active(true, 40), 8).await;
        rig.sim.set_latency(Duration::from_millis(10));
        rig.funnel.submit(DefectEvent::new("a", 1, 0.9)).unwrap();
        rig.funnel.submit(DefectEvent::new("b", 2, 0.8)).unwrap();

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(rig.worker.run(stop_rx));
        sleep(Duration::from_secs(3)).await;
        stop.send_replace(true);
        handle.await.unwrap();

        assert_eq!(rig.sim.writes(), vec![(FLAG, 1), (FLAG, 0), (FLAG, 1), (FLAG, 0)]);
        let writes: Vec<_> = rig
            .sim
            .transactions()
            .into_iter()
            .filter(|t| t.op == Op::Write)
            .collect();
        // Hold between assert and deassert, and no overlap across events.
        assert!(writes[1].started - writes[0].finished >= Duration::from_millis(500));
        assert!(writes[2].started >= writes[1].finished);
        assert!(!rig.sim.overlap_detected());

        let records = defects(&rig.persistence);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].detection_id, "a");
        assert_eq!(records[1].detection_id, "b");
        assert!(records.iter().all(|r| r.pulse_acknowledged));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_event_is_dropped_at_the_gate() {
        let rig = rig(AcquisitionState::default(), 8).await;
        let err = rig.funnel.submit(DefectEvent::new("x", 1, 0.5)).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::GateRejection(RejectReason::NoActiveProcess)
        ));
        assert_eq!(rig.funnel.pending(), 0);
        assert!(rig.sim.writes().is_empty());
        assert_eq!(rig.metrics.snapshot(0).defects_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_revalidates_before_pulsing() {
        let mut rig = rig(active(true, 0), 8).await;
        let event = DefectEvent::new("late", 1, 0.7);
        rig.state.send_replace(AcquisitionState {
            frame: Some(frame(false, 0, 0)),
            process: None,
        });

        assert!(rig.worker.process(event).await.is_none());
        assert!(rig.sim.writes().is_empty());
        assert!(rig.persistence.is_empty());
        assert_eq!(rig.metrics.snapshot(0).defects_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_assert_still_records() {
        let mut rig = rig(active(true, 12), 8).await;
        rig.sim.fail_writes(3);

        let record = rig
            .worker
            .process(DefectEvent::new("d", 1, 0.6))
            .await
            .unwrap();
        assert!(!record.pulse_acknowledged);
        assert_eq!(rig.sim.write_attempts(), 3);
        assert!(rig.sim.writes().is_empty());
        assert_eq!(rig.metrics.snapshot(0).pulse_failures, 1);
        assert_eq!(defects(&rig.persistence).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_deassert_triggers_reset() {
        let rig = rig(active(true, 12), 8).await;
        rig.funnel.submit(DefectEvent::new("d", 1, 0.6)).unwrap();

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(rig.worker.run(stop_rx));
        // Assert has landed, the hold is running.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.sim.register(FLAG), 1);
        rig.sim.fail_writes(3);

        sleep(Duration::from_secs(3)).await;
        stop.send_replace(true);
        handle.await.unwrap();

        assert_eq!(rig.sim.writes(), vec![(FLAG, 1), (FLAG, 0)]);
        assert_eq!(rig.sim.register(FLAG), 0);
        assert_eq!(rig.metrics.snapshot(0).pulse_failures, 1);
        assert!(defects(&rig.persistence)[0].pulse_acknowledged);
    }

    #[tokio::test(start_paused = true)]
    async fn full_backlog_rejects() {
        let rig = rig(active(true, 0), 1).await;
        rig.funnel.submit(DefectEvent::new("1", 1, 0.5)).unwrap();
        let err = rig.funnel.submit(DefectEvent::new("2", 1, 0.5)).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::GateRejection(RejectReason::Backlogged)
        ));
        assert_eq!(rig.funnel.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn length_is_sampled_when_processed() {
        let mut rig = rig(active(true, 100), 8).await;
        rig.funnel.submit(DefectEvent::new("len", 1, 0.5)).unwrap();

        let mut later = active(true, 250);
        later.process = rig.state.borrow().process.clone();
        rig.state.send_replace(later);

        let event = rig.worker.rx.recv().await.unwrap();
        let record = rig.worker.process(event).await.unwrap();
        assert_eq!(record.length_at_detection, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn process_closing_during_hold_keeps_admitted_length() {
        let mut rig = rig(active(true, 100), 8).await;
        let process_id = rig.state.borrow().process.as_ref().unwrap().process_id;

        let state = rig.state;
        let closer = tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            state.send_replace(AcquisitionState {
                frame: Some(frame(false, 0, 300)),
                process: None,
            });
            state
        });

        let record = rig
            .worker
            .process(DefectEvent::new("hold", 1, 0.5))
            .await
            .unwrap();
        closer.await.unwrap();

        assert!(record.pulse_acknowledged);
        assert_eq!(record.process_id, process_id);
        assert_eq!(record.length_at_detection, 100);
    }
}
