//! # Connection Supervisor
//!
//! Reconnect policy layered on the [`ConnectionStateMachine`]:
//!
//! - exponential backoff between attempts (doubling, capped)
//! - a lockout after too many consecutive failures that lifts once the cap
//!   has elapsed since the last attempt, so the device is probed again
//!   instead of being abandoned
//! - link-loss events from the driver arrive in an inbox and are applied
//!   on the supervisor's own task, never from a driver callback
//!
//! Recovery from `Reconnecting` or `Failed` goes through the `Retry` event
//! so attempts after a loss are counted apart from first connects.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::BackoffPolicy;
use crate::error::{ModbusError, ModbusResult};
use crate::link::{LinkEvent, LinkEventReceiver, LinkEventSender, RadioLink};
use crate::state::{ConnectionEvent, ConnectionState, ConnectionStateMachine};
use crate::transport::LinkTransport;

/// Counters for the life of the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Attempts started from `Disconnected`.
    pub connect_attempts: u64,
    /// Attempts started after a failure or loss.
    pub retry_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub connection_losses: u64,
    /// Calls refused because of the failure lockout.
    pub lockouts: u64,
}

/// Owns the connection lifecycle of one device.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    address: String,
    policy: BackoffPolicy,
    machine: ConnectionStateMachine,
    consecutive_failures: u32,
    backoff: Duration,
    last_attempt: Option<Instant>,
    inbox_tx: LinkEventSender,
    inbox_rx: LinkEventReceiver,
    stats: SupervisorStats,
}

impl ConnectionSupervisor {
    pub fn new(address: impl Into<String>, policy: BackoffPolicy) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            address: address.into(),
            policy,
            machine: ConnectionStateMachine::new(),
            consecutive_failures: 0,
            backoff: policy.initial,
            last_attempt: None,
            inbox_tx,
            inbox_rx,
            stats: SupervisorStats::default(),
        }
    }

    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.machine.is_connected()
    }

    #[inline]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay applied before the next attempt.
    #[inline]
    pub fn current_backoff(&self) -> Duration {
        self.backoff
    }

    #[inline]
    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    /// Sender for the inbox; drivers get a clone on every connect.
    pub fn events(&self) -> LinkEventSender {
        self.inbox_tx.clone()
    }

    /// Apply queued link events. Returns true if a loss was recorded.
    pub fn poll_events(&mut self) -> bool {
        let mut lost = false;
        while let Ok(event) = self.inbox_rx.try_recv() {
            match event {
                LinkEvent::Disconnected { reason } => {
                    if matches!(
                        self.machine.state(),
                        ConnectionState::Connected | ConnectionState::Connecting
                    ) {
                        self.handle_connection_lost(&reason);
                        lost = true;
                    } else {
                        debug!(
                            "Ignoring disconnect event in state {}: {}",
                            self.machine.state(),
                            reason
                        );
                    }
                }
            }
        }
        lost
    }

    /// Record a connection loss: count it as a failure and move to `Reconnecting`.
    pub fn handle_connection_lost(&mut self, reason: &str) {
        warn!("Connection to {} lost: {}", self.address, reason);
        self.stats.connection_losses += 1;
        self.consecutive_failures += 1;
        self.backoff = self.policy.next(self.backoff);
        self.last_attempt = Some(Instant::now());
        if !self.machine.transition(ConnectionEvent::ConnectionLost) {
            self.machine.force_state(ConnectionState::Reconnecting);
        }
    }

    /// Make sure the link is up, connecting if allowed.
    ///
    /// Returns immediately when already connected. Otherwise waits out the
    /// remaining backoff and makes one attempt. Refuses with
    /// [`ModbusError::Backoff`] while the failure lockout is active.
    pub async fn ensure_connected<L: RadioLink>(
        &mut self,
        transport: &mut LinkTransport<L>,
    ) -> ModbusResult<()> {
        self.poll_events();

        if self.machine.is_connected() {
            if transport.is_connected() {
                return Ok(());
            }
            self.handle_connection_lost("link down without notification");
        }

        if !self.machine.can_connect() {
            return Err(ModbusError::connection(format!(
                "cannot connect while {}",
                self.machine.state()
            )));
        }

        if self.consecutive_failures >= self.policy.max_consecutive_failures {
            let since = self
                .last_attempt
                .map(|at| at.elapsed())
                .unwrap_or(self.policy.max);
            if since < self.policy.max {
                self.stats.lockouts += 1;
                let remaining = self.policy.max - since;
                debug!(
                    "{} consecutive failures, next probe in {:?}",
                    self.consecutive_failures, remaining
                );
                return Err(ModbusError::Backoff {
                    remaining_ms: remaining.as_millis() as u64,
                });
            }
            info!(
                "Probing {} after {} consecutive failures",
                self.address, self.consecutive_failures
            );
            self.consecutive_failures = 0;
            self.backoff = self.policy.initial;
        }

        if self.machine.state() == ConnectionState::Failed {
            self.machine.transition(ConnectionEvent::Retry);
        }

        if self.consecutive_failures > 0 {
            if let Some(last) = self.last_attempt {
                let elapsed = last.elapsed();
                if elapsed < self.backoff {
                    let wait = self.backoff - elapsed;
                    info!("Waiting {:?} before reconnecting to {}", wait, self.address);
                    sleep(wait).await;
                }
            }
        }

        let event = match self.machine.state() {
            ConnectionState::Disconnected => {
                self.stats.connect_attempts += 1;
                ConnectionEvent::Connect
            }
            ConnectionState::Reconnecting => {
                self.stats.retry_attempts += 1;
                ConnectionEvent::Retry
            }
            ConnectionState::Backoff => {
                self.stats.retry_attempts += 1;
                ConnectionEvent::BackoffExpired
            }
            other => {
                return Err(ModbusError::connection(format!(
                    "cannot connect while {}",
                    other
                )))
            }
        };
        self.machine.transition(event);
        self.last_attempt = Some(Instant::now());

        // Events from the previous link are meaningless for the new one.
        while self.inbox_rx.try_recv().is_ok() {}

        match transport.connect(&self.address, self.inbox_tx.clone()).await {
            Ok(()) => {
                info!("Connected to {}", self.address);
                self.consecutive_failures = 0;
                self.backoff = self.policy.initial;
                self.stats.successes += 1;
                self.machine.transition(ConnectionEvent::ConnectSuccess);
                Ok(())
            }
            Err(err) => {
                self.consecutive_failures += 1;
                self.backoff = self.policy.next(self.backoff);
                self.stats.failures += 1;
                self.machine.transition(ConnectionEvent::ConnectFailed);
                warn!(
                    "Connection to {} failed ({} consecutive): {}; next backoff {:?}",
                    self.address, self.consecutive_failures, err, self.backoff
                );
                Err(ModbusError::connection(format!(
                    "connect to {} failed: {}",
                    self.address, err
                )))
            }
        }
    }

    /// User-initiated disconnect.
    pub async fn disconnect<L: RadioLink>(&mut self, transport: &mut LinkTransport<L>) {
        if !self.machine.transition(ConnectionEvent::Disconnect) {
            self.machine.force_state(ConnectionState::Disconnected);
        }
        transport.disconnect().await;
        while self.inbox_rx.try_recv().is_ok() {}
    }

    /// Forget failures and backoff, e.g. after the user fixed the device.
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
        self.backoff = self.policy.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangeTimings, LinkFraming};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FlakyLink {
        inner: Arc<Mutex<Flaky>>,
    }

    #[derive(Default)]
    struct Flaky {
        connected: bool,
        outcomes: VecDeque<bool>,
        attempts: u32,
        events: Option<LinkEventSender>,
    }

    impl FlakyLink {
        fn script(&self, outcomes: &[bool]) {
            self.inner.lock().unwrap().outcomes.extend(outcomes);
        }

        fn attempts(&self) -> u32 {
            self.inner.lock().unwrap().attempts
        }

        fn drop_link(&self, notify: bool) {
            let mut flaky = self.inner.lock().unwrap();
            flaky.connected = false;
            if notify {
                if let Some(tx) = &flaky.events {
                    let _ = tx.send(LinkEvent::Disconnected {
                        reason: "peer gone".into(),
                    });
                }
            }
        }
    }

    impl RadioLink for FlakyLink {
        async fn connect(&mut self, _address: &str, events: LinkEventSender) -> ModbusResult<()> {
            let mut flaky = self.inner.lock().unwrap();
            flaky.attempts += 1;
            if flaky.outcomes.pop_front().unwrap_or(true) {
                flaky.connected = true;
                flaky.events = Some(events);
                Ok(())
            } else {
                Err(ModbusError::connection("device not found"))
            }
        }

        async fn disconnect(&mut self) {
            self.inner.lock().unwrap().connected = false;
        }

        fn is_connected(&self) -> bool {
            self.inner.lock().unwrap().connected
        }

        async fn write_with_ack(&mut self, _data: &[u8]) -> ModbusResult<()> {
            Ok(())
        }

        async fn read_status(&mut self) -> ModbusResult<Bytes> {
            Ok(Bytes::new())
        }

        async fn next_notification(&mut self) -> Option<Bytes> {
            None
        }

        fn drain_notifications(&mut self) -> usize {
            0
        }
    }

    fn setup() -> (ConnectionSupervisor, LinkTransport<FlakyLink>, FlakyLink) {
        let link = FlakyLink::default();
        let transport =
            LinkTransport::new(link.clone(), LinkFraming::default(), &ExchangeTimings::default());
        (
            ConnectionSupervisor::new("AA:BB", BackoffPolicy::default()),
            transport,
            link,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_once() {
        let (mut sup, mut transport, link) = setup();
        sup.ensure_connected(&mut transport).await.unwrap();
        sup.ensure_connected(&mut transport).await.unwrap();

        assert_eq!(sup.state(), ConnectionState::Connected);
        assert_eq!(link.attempts(), 1);
        assert_eq!(sup.stats().connect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_double_backoff() {
        let (mut sup, mut transport, link) = setup();
        link.script(&[false, false, true]);

        assert!(sup.ensure_connected(&mut transport).await.is_err());
        assert_eq!(sup.state(), ConnectionState::Failed);
        assert_eq!(sup.current_backoff(), Duration::from_secs(2));

        assert!(sup.ensure_connected(&mut transport).await.is_err());
        assert_eq!(sup.consecutive_failures(), 2);
        assert_eq!(sup.current_backoff(), Duration::from_secs(4));

        let started = Instant::now();
        sup.ensure_connected(&mut transport).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert_eq!(sup.consecutive_failures(), 0);
        assert_eq!(sup.current_backoff(), Duration::from_secs(1));
        assert_eq!(sup.stats().retry_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockout_then_probe() {
        let (mut sup, mut transport, link) = setup();
        link.script(&[false; 5]);

        for _ in 0..5 {
            assert!(sup.ensure_connected(&mut transport).await.is_err());
        }
        assert_eq!(link.attempts(), 5);

        let err = sup.ensure_connected(&mut transport).await.unwrap_err();
        assert!(matches!(err, ModbusError::Backoff { .. }));
        assert_eq!(link.attempts(), 5);
        assert_eq!(sup.stats().lockouts, 1);

        tokio::time::advance(Duration::from_secs(300)).await;
        sup.ensure_connected(&mut transport).await.unwrap();
        assert_eq!(link.attempts(), 6);
        assert!(sup.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_event_goes_through_retry() {
        let (mut sup, mut transport, link) = setup();
        sup.ensure_connected(&mut transport).await.unwrap();

        link.drop_link(true);
        assert!(sup.poll_events());
        assert_eq!(sup.state(), ConnectionState::Reconnecting);
        assert_eq!(sup.consecutive_failures(), 1);
        assert_eq!(sup.current_backoff(), Duration::from_secs(2));

        sup.ensure_connected(&mut transport).await.unwrap();
        assert!(sup.is_connected());
        assert_eq!(sup.stats().retry_attempts, 1);
        assert_eq!(sup.stats().connection_losses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_loss_is_detected() {
        let (mut sup, mut transport, link) = setup();
        sup.ensure_connected(&mut transport).await.unwrap();

        link.drop_link(false);
        sup.ensure_connected(&mut transport).await.unwrap();
        assert_eq!(link.attempts(), 2);
        assert_eq!(sup.stats().connection_losses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnect_ignores_late_events() {
        let (mut sup, mut transport, link) = setup();
        sup.ensure_connected(&mut transport).await.unwrap();

        sup.disconnect(&mut transport).await;
        link.drop_link(true);
        assert!(!sup.poll_events());
        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert_eq!(sup.consecutive_failures(), 0);
    }
}
