//! The gateway service: owns every component and the tasks that drive them.
//!
//! ```text
//! Poller ──────► RegisterChannel ◄────── DefectWorker ◄── DefectFunnel ◄── submit_defect()
//!   │  publishes watch<AcquisitionState> ───────────────────────┘
//!   ├─ frames ─────► AcquisitionQueue ─┐
//!   └─ summaries ──► PersistenceQueue ─┼─► StorageWriter ─► DocumentSink ─► history()
//!       DefectWorker records ──────────┘
//! ```
//!
//! All state lives in one [`Gateway`] value; independent instances do not
//! share anything. Start-up is the only place a failure is fatal: if the link
//! cannot be established within the connect policy, [`Gateway::start`]
//! returns the error and no task is spawned.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::acquisition::{AcquisitionState, Poller, Process, TelemetryFrame};
use crate::config::GatewayConfig;
use crate::defects::{defect_funnel, reset_defect_flag, DefectEvent, DefectFunnel};
use crate::error::GatewayResult;
use crate::hardware::{LinkInfo, RegisterChannel, RegisterMap, RegisterTransport};
use crate::metrics::{GatewayMetrics, MetricsSnapshot};
use crate::queue::BoundedQueue;
use crate::storage::{DocumentSink, Record, RecordKind, StorageWriter};

/// Lifecycle state as reported by [`Gateway::process_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// No process open
    Idle,
    /// One process open
    Active,
}

/// Answer to a process-status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    /// Idle or active
    pub state: ProcessState,
    /// Ids and start snapshot of the open process
    pub process: Option<Process>,
    /// Machine-running flag of the latest frame
    pub machine_running: Option<bool>,
}

/// A running gateway.
pub struct Gateway {
    link: LinkInfo,
    channel: Arc<RegisterChannel>,
    sink: Arc<dyn DocumentSink>,
    acquisition: Arc<BoundedQueue<Record>>,
    persistence: Arc<BoundedQueue<Record>>,
    state: watch::Receiver<AcquisitionState>,
    funnel: DefectFunnel,
    metrics: Arc<GatewayMetrics>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Gateway {
    /// Validate the configuration, open the link, reset the defect flag and
    /// spawn the poller, defect worker and storage writer.
    pub async fn start(
        config: GatewayConfig,
        transport: Box<dyn RegisterTransport>,
        sink: Arc<dyn DocumentSink>,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let metrics = Arc::new(GatewayMetrics::default());
        let channel = Arc::new(RegisterChannel::new(
            transport,
            &config.link,
            Arc::clone(&metrics),
        ));
        let link = channel.connect().await?;

        let map = RegisterMap::new(config.registers.clone());
        // A previous run may have died mid-pulse.
        reset_defect_flag(&channel, map.defect_flag()).await;

        let acquisition = Arc::new(BoundedQueue::new("acquisition", config.queues.capacity));
        let persistence = Arc::new(BoundedQueue::new("persistence", config.queues.capacity));

        let poller = Poller::new(
            Arc::clone(&channel),
            map.clone(),
            &config.poller,
            Arc::clone(&acquisition),
            Arc::clone(&persistence),
            Arc::clone(&metrics),
        );
        let state = poller.subscribe();

        let (funnel, worker) = defect_funnel(
            &config.defects,
            config.queues.defect_backlog,
            state.clone(),
            Arc::clone(&channel),
            map.defect_flag(),
            Arc::clone(&persistence),
            Arc::clone(&metrics),
        );

        let writer = StorageWriter::new(
            Arc::clone(&sink),
            Arc::clone(&persistence),
            Arc::clone(&acquisition),
            &config.storage,
            Arc::clone(&metrics),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            ("poller", tokio::spawn(poller.run(shutdown_rx.clone()))),
            ("defect_worker", tokio::spawn(worker.run(shutdown_rx.clone()))),
            ("storage_writer", tokio::spawn(writer.run(shutdown_rx))),
        ];

        info!(
            name = %config.application.name,
            target = %link.target,
            unit_id = link.unit_id,
            poll_interval = ?config.poller.interval,
            queue_capacity = config.queues.capacity,
            "Gateway started"
        );

        Ok(Self {
            link,
            channel,
            sink,
            acquisition,
            persistence,
            state,
            funnel,
            metrics,
            shutdown,
            tasks,
        })
    }

    /// Link identity established at start-up.
    pub fn link(&self) -> &LinkInfo {
        &self.link
    }

    /// Gate a defect event and queue it for the worker.
    pub fn submit_defect(&self, event: DefectEvent) -> GatewayResult<()> {
        self.funnel.submit(event)
    }

    /// A submission handle for event sources running on other tasks.
    pub fn defect_funnel(&self) -> DefectFunnel {
        self.funnel.clone()
    }

    /// Most recently polled frame.
    pub fn latest_telemetry(&self) -> Option<TelemetryFrame> {
        self.state.borrow().frame.clone()
    }

    /// Whether a process is open, and which.
    pub fn process_status(&self) -> ProcessStatus {
        let state = self.state.borrow();
        ProcessStatus {
            state: if state.is_active() {
                ProcessState::Active
            } else {
                ProcessState::Idle
            },
            process: state.process.clone(),
            machine_running: state.frame.as_ref().map(|f| f.machine_running),
        }
    }

    /// Receiver for every published acquisition state.
    pub fn subscribe(&self) -> watch::Receiver<AcquisitionState> {
        self.state.clone()
    }

    /// Stored records of `kind` in `[from, to]`.
    pub async fn history(
        &self,
        kind: RecordKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GatewayResult<Vec<Record>> {
        self.sink.query(kind, from, to).await
    }

    /// Entries waiting in the (acquisition, persistence) queues.
    pub fn pending_writes(&self) -> (usize, usize) {
        (self.acquisition.len(), self.persistence.len())
    }

    /// Current counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.acquisition.evicted() + self.persistence.evicted())
    }

    /// Stop scheduling ticks, let in-flight operations finish, then close the
    /// link. Entries still queued are not written.
    pub async fn shutdown(self) -> MetricsSnapshot {
        info!("Gateway shutting down");
        self.shutdown.send_replace(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Gateway task ended abnormally");
            }
        }
        self.channel.disconnect().await;

        let snapshot = self
            .metrics
            .snapshot(self.acquisition.evicted() + self.persistence.evicted());
        info!(
            acquisition_pending = self.acquisition.len(),
            persistence_pending = self.persistence.len(),
            store_writes = snapshot.store_writes,
            store_drops = snapshot.store_drops,
            queue_evictions = snapshot.queue_evictions,
            "Gateway stopped"
        );
        snapshot
    }
}
