//! Serialized access to the register link.
//!
//! `RegisterChannel` is the only owner of the [`RegisterTransport`]. Every
//! connect, read and write locks the same `tokio::sync::Mutex`, which is
//! FIFO-fair, so transactions reach the wire one at a time and in submission
//! order no matter how many tasks share the channel.
//!
//! ```text
//! Poller ──read_block──┐
//!                      ├─► Mutex<Link> ─► RegisterTransport ─► controller
//! DefectWorker ─write──┘
//! ```
//!
//! Reads and writes never return an error: after the I/O retry budget is
//! spent they report "unavailable" (`None` / `false`) so periodic callers can
//! skip the cycle. Only [`RegisterChannel::connect`] surfaces a
//! [`GatewayError::Connection`], which is fatal at start-up.
//!
//! A pulse (assert, hold, deassert) is two independent transactions. Nothing
//! here makes it atomic; a link loss between them can leave the asserted
//! value in place, which is why the defect funnel carries its own reset path.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::transport::{LinkInfo, RegisterTransport};
use crate::config::LinkConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::GatewayMetrics;
use crate::retry::RetryPolicy;

struct Link {
    transport: Box<dyn RegisterTransport>,
    info: Option<LinkInfo>,
}

impl Link {
    async fn drop_connection(&mut self) {
        self.transport.disconnect().await;
        self.info = None;
    }
}

/// Single serialization point for all register traffic.
pub struct RegisterChannel {
    target: String,
    connect_policy: RetryPolicy,
    io_policy: RetryPolicy,
    io_timeout: Duration,
    link: Mutex<Link>,
    metrics: Arc<GatewayMetrics>,
}

impl RegisterChannel {
    /// Wrap a transport. No I/O happens until the first call.
    pub fn new(
        transport: Box<dyn RegisterTransport>,
        config: &LinkConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            target: config.target.clone(),
            connect_policy: config.connect,
            io_policy: config.io,
            io_timeout: config.io_timeout,
            link: Mutex::new(Link {
                transport,
                info: None,
            }),
            metrics,
        }
    }

    /// Establish the link, trying `connect_policy.max_attempts()` times.
    ///
    /// A no-op returning the current link while it is open.
    #[instrument(skip(self), fields(target = %self.target))]
    pub async fn connect(&self) -> GatewayResult<LinkInfo> {
        let mut link = self.link.lock().await;
        if let (true, Some(info)) = (link.transport.is_connected(), link.info.clone()) {
            return Ok(info);
        }
        self.open(&mut link, self.connect_policy).await
    }

    /// Close the link. The next transaction reconnects lazily.
    pub async fn disconnect(&self) {
        self.link.lock().await.drop_connection().await;
    }

    /// Whether the link is currently open.
    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.transport.is_connected()
    }

    /// Read `count` contiguous registers from `start` in one transaction.
    ///
    /// Returns `None` once every I/O attempt has failed.
    #[instrument(skip(self), level = "debug")]
    pub async fn read_block(&self, start: u16, count: u16) -> Option<Vec<u16>> {
        let result = self
            .transact("read_block", move |transport| {
                Box::pin(async move {
                    let values = transport.read_registers(start, count).await?;
                    if values.len() != usize::from(count) {
                        return Err(GatewayError::TransientIo(format!(
                            "short read: expected {} registers, got {}",
                            count,
                            values.len()
                        )));
                    }
                    Ok(values)
                })
            })
            .await;

        match result {
            Ok(values) => Some(values),
            Err(e) => {
                GatewayMetrics::incr(&self.metrics.io_exhausted);
                warn!(start, count, error = %e, "Register block unavailable");
                None
            }
        }
    }

    /// Write one register. Returns `false` once every I/O attempt has failed.
    #[instrument(skip(self), level = "debug")]
    pub async fn write_register(&self, address: u16, value: u16) -> bool {
        let result = self
            .transact("write_register", move |transport| {
                transport.write_register(address, value)
            })
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                GatewayMetrics::incr(&self.metrics.io_exhausted);
                warn!(address, value, error = %e, "Register write failed");
                false
            }
        }
    }

    /// Run one transaction under the lock with the I/O retry policy.
    async fn transact<T, F>(&self, op: &'static str, mut call: F) -> GatewayResult<T>
    where
        F: for<'a> FnMut(
            &'a mut (dyn RegisterTransport + 'static),
        ) -> BoxFuture<'a, GatewayResult<T>>,
    {
        let mut link = self.link.lock().await;
        let mut attempts = self.io_policy.attempts();
        let mut last_error = GatewayError::TransientIo(format!("{} not attempted", op));

        while let Some(attempt) = attempts.next().await {
            if !link.transport.is_connected() {
                // One connect try per I/O attempt keeps the total wait bounded
                // by the I/O policy.
                if let Err(e) = self.open(&mut link, RetryPolicy::new(1, Duration::ZERO)).await {
                    last_error = e;
                    continue;
                }
            }

            let outcome = timeout(self.io_timeout, call(link.transport.as_mut())).await;
            match outcome {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(op, attempt, "Register transaction recovered");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    warn!(op, attempt, error = %e, "Register transaction failed");
                    if e.is_link_failure() {
                        link.drop_connection().await;
                    }
                    last_error = e;
                }
                Err(_) => {
                    warn!(
                        op,
                        attempt,
                        timeout_ms = self.io_timeout.as_millis() as u64,
                        "Register transaction timed out"
                    );
                    link.drop_connection().await;
                    last_error = GatewayError::Timeout(op);
                }
            }
        }

        Err(last_error)
    }

    async fn open(&self, link: &mut Link, policy: RetryPolicy) -> GatewayResult<LinkInfo> {
        let mut attempts = policy.attempts();
        let mut reason = String::from("no attempt made");

        while let Some(attempt) = attempts.next().await {
            let outcome = timeout(self.io_timeout, link.transport.connect()).await;
            match outcome {
                Ok(Ok(info)) => {
                    GatewayMetrics::incr(&self.metrics.link_reconnects);
                    info!(target = %info.target, unit_id = info.unit_id, attempt, "Register link established");
                    link.info = Some(info.clone());
                    return Ok(info);
                }
                Ok(Err(e)) => {
                    warn!(target = %self.target, attempt, error = %e, "Connect attempt failed");
                    reason = e.to_string();
                }
                Err(_) => {
                    warn!(target = %self.target, attempt, "Connect attempt timed out");
                    reason = "connect timed out".to_string();
                }
            }
            link.transport.disconnect().await;
        }

        Err(GatewayError::Connection {
            target: self.target.clone(),
            attempts: attempts.made(),
            reason,
        })
    }
}
