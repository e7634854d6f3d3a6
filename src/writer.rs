//! # Write Orchestrator
//!
//! Single-register writes (FC06) with password gating.
//!
//! Addresses in the protected range are only honoured once the password
//! register has been written successfully on the current connection. With a
//! device password configured the orchestrator writes it on demand;
//! without one, protected writes are refused before any I/O.
//!
//! Pending writes wait in a bounded [`WriteQueue`]; enqueueing on a full
//! queue fails at once.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::address::RegisterAddress;
use crate::constants::{is_protected_address, PASSWORD_REGISTER};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::Response;
use crate::link::RadioLink;
use crate::session::Session;

// ============================================================================
// Queue
// ============================================================================

/// One pending write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTransaction {
    pub register: RegisterAddress,
    pub value: u16,
    /// Carried for the caller's bookkeeping; the queue is strictly FIFO.
    pub priority: u8,
    pub queued_at: DateTime<Utc>,
}

impl WriteTransaction {
    pub fn new(register: impl Into<RegisterAddress>, value: u16) -> Self {
        Self {
            register: register.into(),
            value,
            priority: 0,
            queued_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Bounded FIFO of pending writes.
#[derive(Debug, Clone)]
pub struct WriteQueue {
    items: VecDeque<WriteTransaction>,
    capacity: usize,
}

impl WriteQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `transaction`, or fail with [`ModbusError::QueueFull`].
    pub fn try_push(&mut self, transaction: WriteTransaction) -> ModbusResult<()> {
        if self.items.len() >= self.capacity {
            warn!(
                "Write queue full ({}), dropping write to {}",
                self.capacity, transaction.register
            );
            return Err(ModbusError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.items.push_back(transaction);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<WriteTransaction> {
        self.items.pop_front()
    }

    /// Put a transaction back at the head, e.g. after a link error.
    pub fn push_front(&mut self, transaction: WriteTransaction) {
        self.items.push_front(transaction);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteTransaction> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Result of one write, as surfaced to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub success: bool,
    pub register: u16,
    pub value: u16,
    /// Actionable message on failure.
    pub message: Option<String>,
    /// Raw exception code when the device rejected the write.
    pub exception_code: Option<u8>,
    pub error: Option<ModbusError>,
}

impl WriteOutcome {
    fn ok(register: u16, value: u16) -> Self {
        Self {
            success: true,
            register,
            value,
            message: None,
            exception_code: None,
            error: None,
        }
    }

    fn failed(register: u16, value: u16, message: String, error: ModbusError) -> Self {
        Self {
            success: false,
            register,
            value,
            message: Some(message),
            exception_code: error.exception_code(),
            error: Some(error),
        }
    }

    /// Failure that never reached the wire.
    pub fn rejected(register: u16, value: u16, error: ModbusError) -> Self {
        Self::failed(register, value, error.to_string(), error)
    }
}

/// Counters for the life of the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub writes: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub authentications: u64,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Executes writes and tracks the password state of the connection.
#[derive(Debug, Clone, Default)]
pub struct WriteOrchestrator {
    password: Option<u16>,
    authenticated: bool,
    stats: WriteStats,
}

impl WriteOrchestrator {
    pub fn new(password: Option<u16>) -> Self {
        Self {
            password,
            authenticated: false,
            stats: WriteStats::default(),
        }
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    #[inline]
    pub fn stats(&self) -> &WriteStats {
        &self.stats
    }

    /// Forget the unlock; the device locks again on every new connection.
    pub fn reset_authentication(&mut self) {
        if self.authenticated {
            debug!("Password state reset");
        }
        self.authenticated = false;
    }

    /// Write `value` to `register`.
    ///
    /// Register-level failures come back as an unsuccessful [`WriteOutcome`];
    /// only link errors are returned as `Err`.
    pub async fn write<L: RadioLink>(
        &mut self,
        session: &mut Session<L>,
        register: RegisterAddress,
        value: u16,
    ) -> ModbusResult<WriteOutcome> {
        let address = register.value();
        if is_protected_address(address) && !self.authenticated {
            match self.password {
                Some(password) => {
                    info!("{} is protected, unlocking with the configured password", register);
                    self.stats.authentications += 1;
                    let unlock = self
                        .execute(session, RegisterAddress::from(PASSWORD_REGISTER), password)
                        .await?;
                    if !unlock.success {
                        let message = unlock
                            .message
                            .unwrap_or_else(|| "password rejected".to_string());
                        error!("Cannot write {}: {}", register, message);
                        let err = ModbusError::authentication(message, unlock.exception_code);
                        self.stats.rejected += 1;
                        return Ok(WriteOutcome::rejected(address, value, err));
                    }
                }
                None => {
                    self.stats.rejected += 1;
                    let err = ModbusError::authentication(
                        format!(
                            "register {} is password protected; write the password to \
                             0x{:04X} first or configure the device password",
                            register, PASSWORD_REGISTER
                        ),
                        None,
                    );
                    warn!("{}", err);
                    return Ok(WriteOutcome::rejected(address, value, err));
                }
            }
        }

        self.execute(session, register, value).await
    }

    async fn execute<L: RadioLink>(
        &mut self,
        session: &mut Session<L>,
        register: RegisterAddress,
        value: u16,
    ) -> ModbusResult<WriteOutcome> {
        let address = register.value();
        self.stats.writes += 1;
        info!("Writing {} = {}", register, value);

        let outcome = match session.write_single(register, value).await {
            Ok(Response::WriteEcho {
                address: echoed,
                value: echoed_value,
            }) if echoed == address && echoed_value == value => {
                if address == PASSWORD_REGISTER {
                    self.authenticated = true;
                    debug!("Password accepted");
                }
                WriteOutcome::ok(address, value)
            }
            Ok(Response::WriteEcho {
                address: echoed,
                value: echoed_value,
            }) => {
                let err = ModbusError::protocol(format!(
                    "echo mismatch: wrote 0x{:04X}={}, device echoed 0x{:04X}={}",
                    address, value, echoed, echoed_value
                ));
                WriteOutcome::failed(address, value, err.to_string(), err)
            }
            Ok(Response::Exception { function, code }) => {
                let message = code.write_message(address, value);
                let err = if code.is_authentication() {
                    self.authenticated = false;
                    ModbusError::authentication(message.clone(), Some(code.code()))
                } else {
                    ModbusError::Exception {
                        function,
                        code: code.code(),
                        message: message.clone(),
                    }
                };
                if address == PASSWORD_REGISTER {
                    self.authenticated = false;
                }
                WriteOutcome::failed(address, value, message, err)
            }
            Ok(Response::Unsupported) => {
                let err = ModbusError::unsupported(format!("device refused write to {}", register));
                WriteOutcome::failed(address, value, err.to_string(), err)
            }
            Ok(Response::Registers(_)) => {
                let err = ModbusError::protocol("read response in answer to a write");
                WriteOutcome::failed(address, value, err.to_string(), err)
            }
            Err(err) if err.is_link_error() => return Err(err),
            Err(err) => WriteOutcome::failed(address, value, err.to_string(), err),
        };

        if outcome.success {
            self.stats.succeeded += 1;
            info!("Wrote {} = {}", register, value);
        } else {
            self.stats.failed += 1;
            error!(
                "Write to {} failed: {}",
                register,
                outcome.message.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::constants::EXCEPTION_READ_ONLY;
    use crate::error::ErrorCategory;
    use crate::link::LinkEventSender;
    use crate::sim::SimulatedDevice;
    use tokio::sync::mpsc;

    async fn session(device: &SimulatedDevice) -> Session<SimulatedDevice> {
        let mut session = Session::new(device.clone(), &EngineConfig::new("sim"));
        let (tx, _rx): (LinkEventSender, _) = mpsc::unbounded_channel();
        session.transport_mut().connect("sim", tx).await.unwrap();
        session
    }

    #[test]
    fn test_queue_is_bounded_fifo() {
        let mut queue = WriteQueue::new(2);
        queue.try_push(WriteTransaction::new(0xE001u16, 1)).unwrap();
        queue
            .try_push(WriteTransaction::new(0xE002u16, 2).with_priority(9))
            .unwrap();
        let err = queue.try_push(WriteTransaction::new(0xE003u16, 3)).unwrap_err();
        assert_eq!(err, ModbusError::QueueFull { capacity: 2 });

        // Priority does not reorder.
        assert_eq!(queue.pop().unwrap().value, 1);
        assert_eq!(queue.pop().unwrap().value, 2);
        assert!(queue.pop().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_write() {
        let device = SimulatedDevice::new();
        let mut session = session(&device).await;
        let mut writer = WriteOrchestrator::new(None);

        let outcome = writer
            .write(&mut session, RegisterAddress::from(0x0200), 42)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(device.register(0x0200), Some(42));
        assert_eq!(writer.stats().succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protected_write_without_password_never_reaches_wire() {
        let device = SimulatedDevice::new().with_password(4321);
        let mut session = session(&device).await;
        let mut writer = WriteOrchestrator::new(None);

        let outcome = writer
            .write(&mut session, RegisterAddress::from(0xE050), 5)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_ref().map(ModbusError::category),
            Some(ErrorCategory::Authentication)
        );
        assert!(outcome.message.unwrap().contains("0xE203"));
        assert_eq!(device.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_password_write_unlocks_protected_range() {
        let device = SimulatedDevice::new().with_password(4321);
        let mut session = session(&device).await;
        let mut writer = WriteOrchestrator::new(None);

        let unlock = writer
            .write(&mut session, RegisterAddress::from(PASSWORD_REGISTER), 4321)
            .await
            .unwrap();
        assert!(unlock.success);
        assert!(writer.is_authenticated());

        let outcome = writer
            .write(&mut session, RegisterAddress::from(0xE050), 5)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(device.register(0xE050), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_password_auto_unlocks() {
        let device = SimulatedDevice::new().with_password(4321);
        let mut session = session(&device).await;
        let mut writer = WriteOrchestrator::new(Some(4321));

        let outcome = writer
            .write(&mut session, RegisterAddress::from(0xE004), 560)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(device.request_count(), 2);
        assert_eq!(writer.stats().authentications, 1);

        writer
            .write(&mut session, RegisterAddress::from(0xE005), 570)
            .await
            .unwrap();
        assert_eq!(device.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_password_is_authentication_error() {
        let device = SimulatedDevice::new().with_password(4321);
        let mut session = session(&device).await;
        let mut writer = WriteOrchestrator::new(Some(1111));

        let outcome = writer
            .write(&mut session, RegisterAddress::from(0xE004), 560)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exception_code, Some(0x05));
        assert!(outcome.message.unwrap().contains("Incorrect password"));
        assert!(!writer.is_authenticated());
        assert_eq!(device.register(0xE004), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_exception_maps_to_message() {
        let device = SimulatedDevice::new().with_read_only(0x0300);
        let mut session = session(&device).await;
        let mut writer = WriteOrchestrator::new(None);

        let outcome = writer
            .write(&mut session, RegisterAddress::from(0x0300), 1)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exception_code, Some(EXCEPTION_READ_ONLY));
        assert!(outcome.message.unwrap().contains("Read-only"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_error_is_returned() {
        let device = SimulatedDevice::new();
        let mut session = session(&device).await;
        let mut writer = WriteOrchestrator::new(None);
        device.drop_link("gone");

        let err = writer
            .write(&mut session, RegisterAddress::from(0x0200), 1)
            .await
            .unwrap_err();
        assert!(err.is_link_error());
    }
}
