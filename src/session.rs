//! One request/response cycle: build the frame, run the exchange, decode the
//! answer and record its latency.

use std::time::Duration;

use tokio::time::Instant;

use crate::address::RegisterAddress;
use crate::config::{EngineConfig, ExchangeTimings};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{FrameCodec, Response};
use crate::learner::TimeoutLearner;
use crate::link::RadioLink;
use crate::logging::LoggingMode;
use crate::timing::{TimingCollector, OP_MODBUS_READ, OP_MODBUS_WRITE};
use crate::transport::LinkTransport;

/// Codec, transport and latency tracking for one device.
#[derive(Debug)]
pub struct Session<L> {
    transport: LinkTransport<L>,
    codec: FrameCodec,
    timing: TimingCollector,
    learner: TimeoutLearner,
    timings: ExchangeTimings,
    adaptive: bool,
}

impl<L: RadioLink> Session<L> {
    pub fn new(link: L, config: &EngineConfig) -> Self {
        let learner = TimeoutLearner::new(config.timing)
            .with_default(OP_MODBUS_READ, config.timings.response_timeout)
            .with_default(OP_MODBUS_WRITE, config.timings.write_timeout);
        Self {
            transport: LinkTransport::new(link, config.framing.clone(), &config.timings),
            codec: FrameCodec::new(config.slave_id, config.framing.clone()),
            timing: TimingCollector::new(&config.timing),
            learner,
            timings: config.timings,
            adaptive: config.adaptive_timeouts,
        }
    }

    pub fn with_logging(mut self, mode: LoggingMode) -> Self {
        self.transport = self.transport.with_logging(mode);
        self
    }

    #[inline]
    pub fn transport(&self) -> &LinkTransport<L> {
        &self.transport
    }

    #[inline]
    pub fn transport_mut(&mut self) -> &mut LinkTransport<L> {
        &mut self.transport
    }

    #[inline]
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    #[inline]
    pub fn timing(&self) -> &TimingCollector {
        &self.timing
    }

    #[inline]
    pub fn timing_mut(&mut self) -> &mut TimingCollector {
        &mut self.timing
    }

    #[inline]
    pub fn learner(&self) -> &TimeoutLearner {
        &self.learner
    }

    #[inline]
    pub fn learner_mut(&mut self) -> &mut TimeoutLearner {
        &mut self.learner
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Response timeout for `operation`: learned when adaptive, static otherwise.
    pub fn response_timeout(&self, operation: &str) -> Duration {
        if self.adaptive {
            self.learner.timeout_for(&self.timing, operation)
        } else if operation == OP_MODBUS_WRITE {
            self.timings.write_timeout
        } else {
            self.timings.response_timeout
        }
    }

    /// Read `count` holding registers starting at `start`.
    ///
    /// Exception answers come back as [`ModbusError::Exception`], sentinel
    /// answers as [`ModbusError::Unsupported`].
    pub async fn read_span(&mut self, start: RegisterAddress, count: u16) -> ModbusResult<Vec<u16>> {
        let request = self.codec.build_read(start, count)?;
        let wait = self.response_timeout(OP_MODBUS_READ);
        let operation = format!("read {}+{}", start, count);

        let started = Instant::now();
        let raw = self.transport.exchange(&request, wait, &operation).await?;
        let elapsed = started.elapsed();

        let result = self.codec.decode(&raw).and_then(|response| match response {
            Response::Registers(words) if words.len() == count as usize => Ok(words),
            Response::Registers(words) => Err(ModbusError::frame(format!(
                "expected {} registers, got {}",
                count,
                words.len()
            ))),
            Response::Exception { function, code } => Err(ModbusError::Exception {
                function,
                code: code.code(),
                message: code.description().to_string(),
            }),
            Response::Unsupported => Err(ModbusError::unsupported(format!(
                "device refused {}",
                operation
            ))),
            Response::WriteEcho { .. } => Err(ModbusError::protocol(format!(
                "write echo in answer to {}",
                operation
            ))),
        });
        self.timing.record(OP_MODBUS_READ, elapsed, result.is_ok());
        result
    }

    /// Write one register and return the decoded answer.
    ///
    /// Exceptions are returned as [`Response::Exception`] so the caller can
    /// map the code to a message.
    pub async fn write_single(&mut self, address: RegisterAddress, value: u16) -> ModbusResult<Response> {
        let request = self.codec.build_write(address, value)?;
        let wait = self.response_timeout(OP_MODBUS_WRITE);
        let operation = format!("write {}", address);

        let started = Instant::now();
        let raw = self.transport.exchange(&request, wait, &operation).await;
        let elapsed = started.elapsed();
        let response = match raw {
            Ok(raw) => match self.codec.decode(&raw) {
                Ok(response) => response,
                Err(err) => {
                    self.timing.record(OP_MODBUS_WRITE, elapsed, false);
                    return Err(err);
                }
            },
            Err(ModbusError::Unsupported { .. }) => Response::Unsupported,
            Err(err) => return Err(err),
        };
        self.timing.record(OP_MODBUS_WRITE, elapsed, response.is_success());
        Ok(response)
    }
}
