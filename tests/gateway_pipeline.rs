//! End-to-end tests of the running gateway against the simulated controller
//! and an in-memory sink. Time is paused, so multi-second scenarios run
//! instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use textile_gateway::config::GatewayConfig;
use textile_gateway::defects::DefectEvent;
use textile_gateway::error::{GatewayError, RejectReason};
use textile_gateway::gateway::{Gateway, ProcessState};
use textile_gateway::hardware::simulator::Op;
use textile_gateway::hardware::{MachineSimulation, RegisterMap, SimulatedController};
use textile_gateway::retry::RetryPolicy;
use textile_gateway::storage::{MemorySink, Record, RecordKind};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing_test::traced_test;

const FLAG: u16 = 6;

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.link.target = "sim".to_string();
    config.queues.capacity = 8;
    config
}

/// Set every telemetry register except the defect flag.
fn machine(sim: &SimulatedController, production: u16, length: u16, start: bool, running: bool) {
    let status = if running { 1 } else { 2 };
    sim.set_registers(
        0,
        &[status, production, 0, length, u16::from(start), u16::from(running)],
    );
}

async fn start(config: GatewayConfig) -> (Gateway, SimulatedController, Arc<MemorySink>) {
    let sim = SimulatedController::new(16);
    let sink = Arc::new(MemorySink::new());
    let gateway = Gateway::start(config, Box::new(sim.clone()), sink.clone())
        .await
        .unwrap();
    (gateway, sim, sink)
}

async fn history(gateway: &Gateway, kind: RecordKind) -> Vec<Record> {
    let now = Utc::now();
    gateway
        .history(kind, now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn production_run_is_summarized_once() {
    let (gateway, sim, sink) = start(config()).await;
    machine(&sim, 1000, 200, false, true);
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(gateway.process_status().state, ProcessState::Idle);

    machine(&sim, 1000, 200, true, true);
    sleep(Duration::from_secs(1)).await;
    let status = gateway.process_status();
    assert_eq!(status.state, ProcessState::Active);
    let process = status.process.unwrap();
    assert_eq!(process.start_production, 1000);
    assert_eq!(process.start_length, 200);
    assert!(process.textile_id.starts_with("TX-"));

    machine(&sim, 1450, 610, false, true);
    sleep(Duration::from_secs(3)).await;
    assert_eq!(gateway.process_status().state, ProcessState::Idle);

    let summaries = history(&gateway, RecordKind::ProcessSummary).await;
    assert_eq!(summaries.len(), 1);
    match &summaries[0] {
        Record::ProcessSummary(summary) => {
            assert_eq!(summary.process_id, process.process_id);
            assert_eq!(summary.production_delta, 450);
            assert_eq!(summary.fabric_delta, 410);
            assert!(summary.duration_minutes >= 0.0);
        }
        other => panic!("unexpected record {other:?}"),
    }

    // Three distinct states were observed; repeats were suppressed.
    assert_eq!(sink.records_of(RecordKind::Telemetry).len(), 3);
    let metrics = gateway.shutdown().await;
    assert_eq!(metrics.processes_opened, 1);
    assert_eq!(metrics.processes_closed, 1);
    assert_eq!(metrics.frames_enqueued, 3);
}

#[tokio::test(start_paused = true)]
async fn unchanged_machine_is_persisted_once() {
    let (gateway, sim, sink) = start(config()).await;
    machine(&sim, 7, 3, false, false);
    sleep(Duration::from_secs(10)).await;

    let metrics = gateway.metrics();
    assert!(metrics.polls >= 10);
    assert_eq!(metrics.frames_enqueued, 1);
    assert_eq!(sink.records_of(RecordKind::Telemetry).len(), 1);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unavailable_reads_skip_the_tick() {
    let (gateway, sim, sink) = start(config()).await;
    machine(&sim, 5, 5, false, true);
    sleep(Duration::from_millis(500)).await;
    let before = gateway.metrics();
    assert_eq!(before.frames_enqueued, 1);

    // The next poll exhausts its three read attempts.
    sim.fail_reads(3);
    machine(&sim, 6, 6, true, true);
    sleep(Duration::from_millis(1000)).await;

    let after = gateway.metrics();
    assert_eq!(after.polls_skipped, 1);
    assert_eq!(after.frames_enqueued, 1);
    assert_eq!(gateway.process_status().state, ProcessState::Idle);
    assert_eq!(gateway.latest_telemetry().unwrap().total_production, 5);

    // The following tick picks the change up.
    sleep(Duration::from_secs(1)).await;
    assert_eq!(gateway.process_status().state, ProcessState::Active);
    assert_eq!(sink.records_of(RecordKind::Telemetry).len(), 2);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn storage_outage_never_stalls_acquisition() {
    let mut config = config();
    config.queues.capacity = 3;
    config.storage.retry = RetryPolicy::new(50, Duration::from_millis(500));
    let (gateway, sim, sink) = start(config.clone()).await;
    sink.set_available(false);

    let (stop, stop_rx) = watch::channel(false);
    let map = RegisterMap::new(config.registers.clone());
    let simulation = MachineSimulation::new(sim.clone(), map, 0, 10_000);
    tokio::spawn(simulation.run(Duration::from_secs(1), stop_rx));

    sleep(Duration::from_secs(30)).await;
    let during = gateway.metrics();
    let (acquisition, persistence) = gateway.pending_writes();
    assert!(acquisition <= 3);
    assert!(persistence <= 3);
    assert!(during.polls >= 30);
    assert!(during.frames_enqueued >= 25);
    assert!(during.queue_evictions > 0);
    assert_eq!(during.store_writes, 0);
    assert!(during.store_failures > 0);

    // Acquisition kept up with the machine throughout the outage.
    let latest = gateway.latest_telemetry().unwrap();
    assert!(latest.total_production > 0);

    sink.set_available(true);
    sleep(Duration::from_secs(3)).await;
    assert!(gateway.metrics().store_writes > 0);

    stop.send_replace(true);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn startup_resets_the_defect_flag() {
    let sim = SimulatedController::new(16);
    sim.set_register(FLAG, 1);
    let gateway = Gateway::start(config(), Box::new(sim.clone()), Arc::new(MemorySink::new()))
        .await
        .unwrap();
    assert_eq!(sim.register(FLAG), 0);
    assert_eq!(sim.writes(), vec![(FLAG, 0)]);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_controller_is_fatal_at_startup() {
    let sim = SimulatedController::new(16);
    sim.fail_connects(100);
    let result = Gateway::start(config(), Box::new(sim.clone()), Arc::new(MemorySink::new())).await;
    match result {
        Err(GatewayError::Connection { attempts, .. }) => assert_eq!(attempts, 3),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("gateway started without a link"),
    }
    assert_eq!(sim.connect_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn invalid_config_is_rejected_before_connecting() {
    let mut config = config();
    config.queues.capacity = 0;
    let sim = SimulatedController::new(16);
    let result = Gateway::start(config, Box::new(sim.clone()), Arc::new(MemorySink::new())).await;
    assert!(matches!(result, Err(GatewayError::Configuration(_))));
    assert_eq!(sim.connect_calls(), 0);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn idle_defect_is_dropped_without_pulse() {
    let (gateway, sim, sink) = start(config()).await;
    machine(&sim, 0, 0, false, true);
    sleep(Duration::from_millis(1500)).await;

    let err = gateway
        .submit_defect(DefectEvent::new("cam1-0001", 1, 0.97))
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::GateRejection(RejectReason::NoActiveProcess)
    ));
    sleep(Duration::from_secs(2)).await;

    // Only the start-up reset was ever written.
    assert_eq!(sim.writes(), vec![(FLAG, 0)]);
    assert!(sink.records_of(RecordKind::Defect).is_empty());
    assert!(logs_contain("Defect event rejected"));
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stopped_machine_rejects_defects() {
    let (gateway, sim, _sink) = start(config()).await;
    machine(&sim, 0, 0, true, false);
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(gateway.process_status().state, ProcessState::Active);

    let err = gateway
        .submit_defect(DefectEvent::new("cam1-0002", 1, 0.5))
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::GateRejection(RejectReason::MachineNotRunning)
    ));
    assert_eq!(gateway.metrics().defects_rejected, 1);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn back_to_back_defects_pulse_in_sequence() {
    let (gateway, sim, sink) = start(config()).await;
    sim.set_latency(Duration::from_millis(20));
    machine(&sim, 100, 40, true, true);
    sleep(Duration::from_millis(1500)).await;
    let process = gateway.process_status().process.unwrap();

    gateway
        .submit_defect(DefectEvent::new("cam1-0003", 1, 0.9))
        .unwrap();
    gateway
        .submit_defect(DefectEvent::new("cam1-0004", 2, 0.8))
        .unwrap();
    sleep(Duration::from_secs(4)).await;

    assert_eq!(
        sim.writes(),
        vec![(FLAG, 0), (FLAG, 1), (FLAG, 0), (FLAG, 1), (FLAG, 0)]
    );
    let writes: Vec<_> = sim
        .transactions()
        .into_iter()
        .filter(|t| t.op == Op::Write)
        .collect();
    // First pulse completes before the second begins.
    assert!(writes[3].started >= writes[2].finished);
    assert!(writes[2].started - writes[1].finished >= Duration::from_millis(500));
    assert!(!sim.overlap_detected());

    let defects = sink.records_of(RecordKind::Defect);
    assert_eq!(defects.len(), 2);
    for record in defects {
        match record {
            Record::Defect(defect) => {
                assert_eq!(defect.process_id, process.process_id);
                assert_eq!(defect.length_at_detection, 40);
                assert!(defect.pulse_acknowledged);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }
    let metrics = gateway.shutdown().await;
    assert_eq!(metrics.defects_accepted, 2);
    assert_eq!(metrics.defects_processed, 2);
}

#[tokio::test(start_paused = true)]
async fn poller_and_defect_worker_never_overlap_on_the_link() {
    let mut config = config();
    config.poller.interval = Duration::from_millis(200);
    config.storage.tick = Duration::from_millis(50);
    config.defects.hold = Duration::from_millis(70);
    let (gateway, sim, _sink) = start(config).await;
    sim.set_latency(Duration::from_millis(30));
    machine(&sim, 1, 1, true, true);
    sleep(Duration::from_millis(500)).await;

    for i in 0..10 {
        gateway
            .submit_defect(DefectEvent::new(format!("burst-{i}"), 1, 0.5))
            .unwrap();
        sleep(Duration::from_millis(45)).await;
    }
    sleep(Duration::from_secs(5)).await;

    assert!(!sim.overlap_detected());
    let log = sim.transactions();
    assert!(log.iter().filter(|t| t.op == Op::Read).count() > 10);
    for pair in log.windows(2) {
        assert!(pair[1].started >= pair[0].finished, "overlap: {pair:?}");
    }
    let metrics = gateway.shutdown().await;
    assert_eq!(metrics.defects_processed, 10);
}
