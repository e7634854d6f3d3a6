//! Radio link driver interface.
//!
//! The engine never talks to a BLE stack directly. A driver implements
//! [`RadioLink`] over its GATT characteristics: a write characteristic with
//! acknowledgement, a status characteristic read back after each write, and
//! a notify characteristic that carries the Modbus response.
//!
//! Link loss is reported as a [`LinkEvent`] sent into the supervisor's inbox
//! through the [`LinkEventSender`] handed over at connect time, never through
//! a callback.

use std::future::Future;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ModbusResult;

/// Events a driver reports outside of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The peer or the stack dropped the connection.
    Disconnected { reason: String },
}

/// Sending half of the supervisor inbox.
pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Receiving half of the supervisor inbox.
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// Physical link to one device.
///
/// Only one exchange is ever in flight; implementations need no internal
/// locking for the engine's sake.
pub trait RadioLink: Send {
    /// Open the link and subscribe to notifications.
    ///
    /// `events` must receive a [`LinkEvent::Disconnected`] whenever the link
    /// drops on its own.
    fn connect(
        &mut self,
        address: &str,
        events: LinkEventSender,
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Close the link. Never fails; a link that is already down stays down.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    fn is_connected(&self) -> bool;

    /// Write a request and wait for the link-level acknowledgement.
    fn write_with_ack(&mut self, data: &[u8]) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Read the status characteristic after a write.
    fn read_status(&mut self) -> impl Future<Output = ModbusResult<Bytes>> + Send;

    /// Next notification payload; `None` once the link is gone.
    ///
    /// May wait forever while connected; callers bound it with a timeout.
    fn next_notification(&mut self) -> impl Future<Output = Option<Bytes>> + Send;

    /// Drop notifications left over from earlier exchanges; returns how many.
    fn drain_notifications(&mut self) -> usize;
}
