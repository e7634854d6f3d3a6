//! # Link Transport
//!
//! Runs one request/response exchange over a [`RadioLink`]:
//!
//! 1. fail fast if the link is down or the stuck-link breaker is open
//! 2. drop stale notifications
//! 3. write the request and wait for the acknowledgement (bounded by the
//!    write timeout; an unacknowledged write drops the link)
//! 4. wait the settle delay
//! 5. read the status characteristic (bounded like the write; a failed read
//!    drops the link)
//! 6. wait for the response notification, bounded by the timeout
//!
//! ## Stuck-Link Breaker
//!
//! Consecutive timeouts are counted. Once the count reaches the configured
//! threshold the next exchange tears the link down and fails with
//! [`ModbusError::CircuitOpen`], so the caller reconnects instead of waiting
//! on a dead link forever. Any answer (data, exception, or sentinel) resets
//! the count, and so does a disconnect.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::config::{ExchangeTimings, LinkFraming};
use crate::error::{ModbusError, ModbusResult};
use crate::link::{LinkEventSender, RadioLink};
use crate::logging::{format_hex_packet, log_packet, LoggingMode};

/// Counters for the life of the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    pub errors: u64,
    /// Sentinel answers.
    pub unsupported: u64,
    pub breaker_trips: u64,
    pub stale_notifications: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Exchange executor with the stuck-link breaker.
#[derive(Debug)]
pub struct LinkTransport<L> {
    link: L,
    framing: LinkFraming,
    settle_delay: Duration,
    ack_timeout: Duration,
    max_consecutive_timeouts: u32,
    consecutive_timeouts: u32,
    stats: TransportStats,
    logging: LoggingMode,
}

impl<L: RadioLink> LinkTransport<L> {
    pub fn new(link: L, framing: LinkFraming, timings: &ExchangeTimings) -> Self {
        Self {
            link,
            framing,
            settle_delay: timings.settle_delay,
            ack_timeout: timings.write_timeout,
            max_consecutive_timeouts: timings.max_consecutive_timeouts,
            consecutive_timeouts: 0,
            stats: TransportStats::default(),
            logging: LoggingMode::default(),
        }
    }

    pub fn with_logging(mut self, mode: LoggingMode) -> Self {
        self.logging = mode;
        self
    }

    #[inline]
    pub fn link(&self) -> &L {
        &self.link
    }

    #[inline]
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_inner(self) -> L {
        self.link
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    #[inline]
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    #[inline]
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// True when the next exchange will trip the breaker.
    #[inline]
    pub fn breaker_open(&self) -> bool {
        self.consecutive_timeouts >= self.max_consecutive_timeouts
    }

    /// Open the link. The timeout counter starts from zero on a new link.
    pub async fn connect(&mut self, address: &str, events: LinkEventSender) -> ModbusResult<()> {
        self.consecutive_timeouts = 0;
        self.link.connect(address, events).await
    }

    /// Close the link and reset the timeout counter.
    pub async fn disconnect(&mut self) {
        self.consecutive_timeouts = 0;
        self.link.disconnect().await;
    }

    /// Send `request` and return the raw response notification.
    ///
    /// A sentinel answer is returned as [`ModbusError::Unsupported`]; other
    /// answers (including exception frames) are returned for the codec to
    /// decode.
    pub async fn exchange(
        &mut self,
        request: &[u8],
        response_timeout: Duration,
        operation: &str,
    ) -> ModbusResult<Bytes> {
        if !self.link.is_connected() {
            return Err(ModbusError::NotConnected);
        }

        if self.breaker_open() {
            let timeouts = self.consecutive_timeouts;
            warn!(
                "{} consecutive timeouts, link considered stuck; disconnecting",
                timeouts
            );
            self.stats.breaker_trips += 1;
            self.disconnect().await;
            return Err(ModbusError::CircuitOpen { timeouts });
        }

        let stale = self.link.drain_notifications();
        if stale > 0 {
            debug!("Dropped {} stale notifications", stale);
            self.stats.stale_notifications += stale as u64;
        }

        let started = Instant::now();
        log_packet(self.logging, "TX", request);
        let acked = match timeout(self.ack_timeout, self.link.write_with_ack(request)).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::timeout(
                "write acknowledgement",
                self.ack_timeout.as_millis() as u64,
            )),
        };
        if let Err(err) = acked {
            warn!("Write not acknowledged: {}; disconnecting", err);
            self.stats.errors += 1;
            self.disconnect().await;
            return Err(ModbusError::connection(format!(
                "write not acknowledged: {}",
                err
            )));
        }
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += request.len() as u64;

        sleep(self.settle_delay).await;

        let status = match timeout(self.ack_timeout, self.link.read_status()).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::timeout(
                "status read",
                self.ack_timeout.as_millis() as u64,
            )),
        };
        match status {
            Ok(status) if self.framing.is_sentinel(&status) => {
                if self.framing.status_sentinel_rejects {
                    return Err(self.unsupported(operation));
                }
                debug!("Status read-back: {}", format_hex_packet(&status));
            }
            Ok(_) => {}
            Err(err) => {
                warn!("Status read failed: {}; disconnecting", err);
                self.stats.errors += 1;
                self.disconnect().await;
                return Err(ModbusError::connection(format!(
                    "status read failed: {}",
                    err
                )));
            }
        }

        match timeout(response_timeout, self.link.next_notification()).await {
            Err(_) => {
                self.consecutive_timeouts += 1;
                self.stats.timeouts += 1;
                warn!(
                    "No response to {} within {:?} ({}/{} consecutive timeouts)",
                    operation,
                    response_timeout,
                    self.consecutive_timeouts,
                    self.max_consecutive_timeouts
                );
                Err(ModbusError::timeout(
                    operation,
                    response_timeout.as_millis() as u64,
                ))
            }
            Ok(None) => {
                self.stats.errors += 1;
                self.disconnect().await;
                Err(ModbusError::connection(format!(
                    "link closed while waiting for {}",
                    operation
                )))
            }
            Ok(Some(response)) => {
                log_packet(self.logging, "RX", &response);
                self.consecutive_timeouts = 0;
                self.stats.responses_received += 1;
                self.stats.bytes_received += response.len() as u64;
                if self.framing.is_sentinel(self.framing.strip_header(&response)) {
                    return Err(self.unsupported(operation));
                }
                debug!("{} answered in {:?}", operation, started.elapsed());
                Ok(response)
            }
        }
    }

    fn unsupported(&mut self, operation: &str) -> ModbusError {
        self.consecutive_timeouts = 0;
        self.stats.unsupported += 1;
        debug!("Sentinel answer to {}", operation);
        ModbusError::unsupported(format!("device refused {}", operation))
    }
}
