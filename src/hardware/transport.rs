//! Register transport capability.
//!
//! The gateway does not implement a register protocol itself. Anything that
//! can open a link to a controller and move 16-bit holding registers over it
//! implements [`RegisterTransport`]; [`RegisterChannel`](super::RegisterChannel)
//! owns exactly one transport and serializes every call made on it.
//!
//! # Contract
//! - Methods take `&mut self`: the transport is never shared, only owned.
//! - A failed call returns an error and leaves retrying to the channel.
//! - Implementations must not retry internally and should fail fast; the
//!   channel applies its own timeout around every call.

use async_trait::async_trait;

use crate::error::GatewayResult;

/// Identity of an established link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Address the link was opened against.
    pub target: String,
    /// Unit / slave identifier addressed on the link.
    pub unit_id: u8,
}

/// Capability: Register I/O
///
/// A single persistent link to a controller exposing holding registers.
#[async_trait]
pub trait RegisterTransport: Send {
    /// Open the link. Called again after the channel observes a link failure.
    async fn connect(&mut self) -> GatewayResult<LinkInfo>;

    /// Close the link. Must be safe to call when already closed.
    async fn disconnect(&mut self);

    /// Whether the link is currently believed to be open.
    fn is_connected(&self) -> bool;

    /// Read `count` contiguous registers starting at `start`.
    async fn read_registers(&mut self, start: u16, count: u16) -> GatewayResult<Vec<u16>>;

    /// Write a single register.
    async fn write_register(&mut self, address: u16, value: u16) -> GatewayResult<()>;
}
