//! Simulated controller.
//!
//! `SimulatedController` is an in-memory register bank implementing
//! [`RegisterTransport`]. Clones share the same bank, so a test (or the
//! [`MachineSimulation`] driver) keeps a handle to poke registers, inject
//! failures and inspect the transaction log while the channel owns another
//! clone.
//!
//! Every read/write is recorded with its start and end instant, and an
//! overlap flag trips if two transactions are ever in flight at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::registers::RegisterMap;
use super::transport::{LinkInfo, RegisterTransport};
use crate::acquisition::frame::MachineStatus;
use crate::error::{GatewayError, GatewayResult};

/// Kind of recorded transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Block read
    Read,
    /// Single register write
    Write,
}

/// One completed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Read or write
    pub op: Op,
    /// Start address
    pub address: u16,
    /// Register count for reads, written value for writes
    pub value: u16,
    /// When the transaction began
    pub started: Instant,
    /// When the transaction completed
    pub finished: Instant,
}

#[derive(Debug, Default)]
struct Faults {
    connects: u32,
    reads: u32,
    writes: u32,
}

#[derive(Debug)]
struct Bank {
    registers: Vec<u16>,
    connected: bool,
    latency: Duration,
    faults: Faults,
    connect_calls: u32,
    read_attempts: u32,
    write_attempts: u32,
    log: Vec<Transaction>,
}

#[derive(Debug)]
struct Shared {
    bank: Mutex<Bank>,
    in_flight: AtomicBool,
    overlap: AtomicBool,
}

/// In-memory controller with failure injection.
#[derive(Debug, Clone)]
pub struct SimulatedController {
    target: String,
    unit_id: u8,
    shared: Arc<Shared>,
}

impl SimulatedController {
    /// A controller exposing `size` zeroed registers.
    pub fn new(size: usize) -> Self {
        Self {
            target: "sim".to_string(),
            unit_id: 1,
            shared: Arc::new(Shared {
                bank: Mutex::new(Bank {
                    registers: vec![0; size],
                    connected: false,
                    latency: Duration::ZERO,
                    faults: Faults::default(),
                    connect_calls: 0,
                    read_attempts: 0,
                    write_attempts: 0,
                    log: Vec::new(),
                }),
                in_flight: AtomicBool::new(false),
                overlap: AtomicBool::new(false),
            }),
        }
    }

    /// Report a different target / unit in [`LinkInfo`].
    pub fn with_identity(mut self, target: impl Into<String>, unit_id: u8) -> Self {
        self.target = target.into();
        self.unit_id = unit_id;
        self
    }

    /// Set one register.
    pub fn set_register(&self, address: u16, value: u16) {
        let mut bank = self.shared.bank.lock();
        if let Some(slot) = bank.registers.get_mut(usize::from(address)) {
            *slot = value;
        }
    }

    /// Set consecutive registers starting at `address`.
    pub fn set_registers(&self, address: u16, values: &[u16]) {
        for (offset, value) in values.iter().enumerate() {
            self.set_register(address + offset as u16, *value);
        }
    }

    /// Current value of one register.
    pub fn register(&self, address: u16) -> u16 {
        self.shared
            .bank
            .lock()
            .registers
            .get(usize::from(address))
            .copied()
            .unwrap_or(0)
    }

    /// Delay applied inside every read and write.
    pub fn set_latency(&self, latency: Duration) {
        self.shared.bank.lock().latency = latency;
    }

    /// Fail the next `n` connect calls.
    pub fn fail_connects(&self, n: u32) {
        self.shared.bank.lock().faults.connects = n;
    }

    /// Fail the next `n` reads with a transient error.
    pub fn fail_reads(&self, n: u32) {
        self.shared.bank.lock().faults.reads = n;
    }

    /// Fail the next `n` writes with a transient error.
    pub fn fail_writes(&self, n: u32) {
        self.shared.bank.lock().faults.writes = n;
    }

    /// Simulate the peer closing the link.
    pub fn drop_link(&self) {
        self.shared.bank.lock().connected = false;
    }

    /// Number of connect calls received.
    pub fn connect_calls(&self) -> u32 {
        self.shared.bank.lock().connect_calls
    }

    /// Number of read calls received, failed ones included.
    pub fn read_attempts(&self) -> u32 {
        self.shared.bank.lock().read_attempts
    }

    /// Number of write calls received, failed ones included.
    pub fn write_attempts(&self) -> u32 {
        self.shared.bank.lock().write_attempts
    }

    /// Completed transactions in completion order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.shared.bank.lock().log.clone()
    }

    /// Completed transactions of one kind.
    pub fn count_ops(&self, op: Op) -> usize {
        self.shared
            .bank
            .lock()
            .log
            .iter()
            .filter(|t| t.op == op)
            .count()
    }

    /// Completed writes as (address, value) pairs.
    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.shared
            .bank
            .lock()
            .log
            .iter()
            .filter(|t| t.op == Op::Write)
            .map(|t| (t.address, t.value))
            .collect()
    }

    /// Whether two transactions were ever in flight at the same time.
    pub fn overlap_detected(&self) -> bool {
        self.shared.overlap.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Instant {
        if self.shared.in_flight.swap(true, Ordering::SeqCst) {
            self.shared.overlap.store(true, Ordering::SeqCst);
        }
        Instant::now()
    }

    fn end(&self, op: Op, address: u16, value: u16, started: Instant, ok: bool) {
        self.shared.in_flight.store(false, Ordering::SeqCst);
        if ok {
            self.shared.bank.lock().log.push(Transaction {
                op,
                address,
                value,
                started,
                finished: Instant::now(),
            });
        }
    }

    fn not_connected() -> GatewayError {
        GatewayError::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "simulated link is closed",
        ))
    }
}

#[async_trait]
impl RegisterTransport for SimulatedController {
    async fn connect(&mut self) -> GatewayResult<LinkInfo> {
        let mut bank = self.shared.bank.lock();
        bank.connect_calls += 1;
        if bank.faults.connects > 0 {
            bank.faults.connects -= 1;
            return Err(GatewayError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "simulated connect failure",
            )));
        }
        bank.connected = true;
        Ok(LinkInfo {
            target: self.target.clone(),
            unit_id: self.unit_id,
        })
    }

    async fn disconnect(&mut self) {
        self.shared.bank.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.shared.bank.lock().connected
    }

    async fn read_registers(&mut self, start: u16, count: u16) -> GatewayResult<Vec<u16>> {
        let started = self.begin();
        let latency = {
            let mut bank = self.shared.bank.lock();
            bank.read_attempts += 1;
            bank.latency
        };
        if !latency.is_zero() {
            sleep(latency).await;
        }

        let result = {
            let mut bank = self.shared.bank.lock();
            if !bank.connected {
                Err(Self::not_connected())
            } else if bank.faults.reads > 0 {
                bank.faults.reads -= 1;
                Err(GatewayError::TransientIo("simulated read failure".to_string()))
            } else {
                let from = usize::from(start);
                let to = from + usize::from(count);
                bank.registers
                    .get(from..to)
                    .map(<[u16]>::to_vec)
                    .ok_or_else(|| {
                        GatewayError::TransientIo(format!(
                            "illegal data address {}..{}",
                            start,
                            start as usize + count as usize
                        ))
                    })
            }
        };
        self.end(Op::Read, start, count, started, result.is_ok());
        result
    }

    async fn write_register(&mut self, address: u16, value: u16) -> GatewayResult<()> {
        let started = self.begin();
        let latency = {
            let mut bank = self.shared.bank.lock();
            bank.write_attempts += 1;
            bank.latency
        };
        if !latency.is_zero() {
            sleep(latency).await;
        }

        let result = {
            let mut bank = self.shared.bank.lock();
            if !bank.connected {
                Err(Self::not_connected())
            } else if bank.faults.writes > 0 {
                bank.faults.writes -= 1;
                Err(GatewayError::TransientIo("simulated write failure".to_string()))
            } else {
                match bank.registers.get_mut(usize::from(address)) {
                    Some(slot) => {
                        *slot = value;
                        Ok(())
                    }
                    None => Err(GatewayError::TransientIo(format!(
                        "illegal data address {}",
                        address
                    ))),
                }
            }
        };
        self.end(Op::Write, address, value, started, result.is_ok());
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle { remaining: u32 },
    Producing { remaining: u32 },
}

/// Drives a [`SimulatedController`] through repeated production runs:
/// idle for a while, raise the process-start flag, count up production and
/// fabric length, drop the flag, repeat.
pub struct MachineSimulation {
    controller: SimulatedController,
    map: RegisterMap,
    phase: Phase,
    idle_steps: u32,
    run_steps: u32,
    production: u32,
    length: u32,
}

impl MachineSimulation {
    /// Simulate a machine with the given register layout. Each run lasts
    /// `run_steps` steps and is separated by `idle_steps` idle steps.
    pub fn new(
        controller: SimulatedController,
        map: RegisterMap,
        idle_steps: u32,
        run_steps: u32,
    ) -> Self {
        let mut sim = Self {
            controller,
            map,
            phase: Phase::Idle {
                remaining: idle_steps,
            },
            idle_steps,
            run_steps: run_steps.max(1),
            production: 0,
            length: 0,
        };
        sim.publish(MachineStatus::Idle, false);
        sim
    }

    /// Advance the machine by one step.
    pub fn step(&mut self) {
        self.phase = match self.phase {
            Phase::Idle { remaining: 0 } => {
                info!("Simulated process starting");
                self.publish(MachineStatus::Running, true);
                Phase::Producing {
                    remaining: self.run_steps,
                }
            }
            Phase::Idle { remaining } => {
                self.publish(MachineStatus::Idle, false);
                Phase::Idle {
                    remaining: remaining - 1,
                }
            }
            Phase::Producing { remaining: 0 } => {
                info!(
                    production = self.production,
                    length = self.length,
                    "Simulated process finished"
                );
                self.publish(MachineStatus::Stopped, false);
                Phase::Idle {
                    remaining: self.idle_steps,
                }
            }
            Phase::Producing { remaining } => {
                let mut rng = rand::thread_rng();
                self.production = self.production.saturating_add(rng.gen_range(5..=15));
                self.length = self.length.saturating_add(rng.gen_range(2..=6));
                self.publish(MachineStatus::Running, true);
                Phase::Producing {
                    remaining: remaining - 1,
                }
            }
        };
    }

    /// Step every `period` until `shutdown` flips to true.
    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.step(),
            }
        }
        debug!("Machine simulation stopped");
    }

    fn publish(&self, status: MachineStatus, running: bool) {
        let config = self.map.config();
        self.controller.set_register(config.status, status.code());
        self.controller
            .set_registers(config.total_production, &self.map.encode_counter(self.production));
        self.controller
            .set_registers(config.fabric_length, &self.map.encode_counter(self.length));
        self.controller
            .set_register(config.process_start, u16::from(running));
        self.controller
            .set_register(config.machine_running, u16::from(running));
    }
}
