//! # Simulated Device
//!
//! An in-memory inverter behind a [`RadioLink`], used by the tests, the
//! benchmark and the demo binary. It speaks the same wire format as the
//! real bridge: responses arrive as notifications prefixed with the link
//! header, and refused spans are answered with the vendor sentinel.
//!
//! Clones share one device, so a test can keep a clone to inject faults
//! while the engine owns another.
//!
//! ```rust
//! use voltage_ble_modbus::sim::SimulatedDevice;
//!
//! let device = SimulatedDevice::new()
//!     .with_register(0x0100, 2400)
//!     .with_unsupported(0x0105);
//! assert_eq!(device.register(0x0100), Some(2400));
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::config::LinkFraming;
use crate::constants::{
    is_protected_address, DEFAULT_SLAVE_ID, EXCEPTION_FLAG, EXCEPTION_FRAME_ERROR,
    EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_FUNCTION, EXCEPTION_LENGTH_ERROR,
    EXCEPTION_PASSWORD_ERROR, EXCEPTION_PASSWORD_PROTECTION, EXCEPTION_READ_ONLY,
    FC_READ_HOLDING_REGISTERS, FC_WRITE_SINGLE_REGISTER, PASSWORD_REGISTER, REQUEST_FRAME_LEN,
};
use crate::crc::crc16;
use crate::error::{ModbusError, ModbusResult};
use crate::link::{LinkEvent, LinkEventSender, RadioLink};

/// How the device refuses a span containing an unsupported address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefusalStyle {
    /// Vendor sentinel notification.
    #[default]
    Sentinel,
    /// Exception 0x02.
    IllegalAddress,
}

#[derive(Debug)]
struct DeviceState {
    slave_id: u8,
    framing: LinkFraming,
    registers: BTreeMap<u16, u16>,
    unsupported: BTreeSet<u16>,
    refusal: RefusalStyle,
    exceptions: HashMap<u16, u8>,
    read_only: BTreeSet<u16>,
    max_batch: u16,
    password: Option<u16>,
    unlocked: bool,

    connected: bool,
    events: Option<LinkEventSender>,
    pending: VecDeque<(Instant, Bytes)>,
    status: Bytes,

    fail_connects: u32,
    silent: bool,
    drop_responses: u32,
    corrupt_responses: u32,
    fail_status_reads: u32,
    stall_status_reads: bool,
    response_delay: Duration,

    connects: u32,
    requests: Vec<Vec<u8>>,
    reads: Vec<(u16, u16)>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            slave_id: DEFAULT_SLAVE_ID,
            framing: LinkFraming::default(),
            registers: BTreeMap::new(),
            unsupported: BTreeSet::new(),
            refusal: RefusalStyle::default(),
            exceptions: HashMap::new(),
            read_only: BTreeSet::new(),
            max_batch: 32,
            password: None,
            unlocked: false,
            connected: false,
            events: None,
            pending: VecDeque::new(),
            status: Bytes::from_static(&[0x00]),
            fail_connects: 0,
            silent: false,
            drop_responses: 0,
            corrupt_responses: 0,
            fail_status_reads: 0,
            stall_status_reads: false,
            response_delay: Duration::from_millis(20),
            connects: 0,
            requests: Vec::new(),
            reads: Vec::new(),
        }
    }
}

impl DeviceState {
    fn exception(&self, function: u8, code: u8) -> Vec<u8> {
        with_crc(vec![self.slave_id, function | EXCEPTION_FLAG, code])
    }

    fn sentinel(&self) -> Vec<u8> {
        vec![self.framing.sentinel_byte; self.framing.min_sentinel_len.max(1) * 2]
    }

    fn refuse(&self, function: u8) -> Vec<u8> {
        match self.refusal {
            RefusalStyle::Sentinel => self.sentinel(),
            RefusalStyle::IllegalAddress => self.exception(function, EXCEPTION_ILLEGAL_DATA_ADDRESS),
        }
    }

    fn handle(&mut self, request: &[u8]) -> Vec<u8> {
        if request.len() != REQUEST_FRAME_LEN {
            return self.exception(request.get(1).copied().unwrap_or(0), EXCEPTION_FRAME_ERROR);
        }
        let body = &request[..REQUEST_FRAME_LEN - 2];
        let crc = u16::from_le_bytes([request[6], request[7]]);
        let function = request[1];
        if crc16(body) != crc {
            return self.exception(function, EXCEPTION_FRAME_ERROR);
        }

        let address = u16::from_be_bytes([request[2], request[3]]);
        let field = u16::from_be_bytes([request[4], request[5]]);
        match function {
            FC_READ_HOLDING_REGISTERS => self.read(address, field),
            FC_WRITE_SINGLE_REGISTER => self.write(address, field),
            other => self.exception(other, EXCEPTION_ILLEGAL_FUNCTION),
        }
    }

    fn read(&mut self, start: u16, count: u16) -> Vec<u8> {
        self.reads.push((start, count));
        if count == 0 || count > self.max_batch {
            return self.exception(FC_READ_HOLDING_REGISTERS, EXCEPTION_LENGTH_ERROR);
        }
        let span = start as u32..start as u32 + count as u32;
        if span.clone().any(|a| a > u16::MAX as u32 || self.unsupported.contains(&(a as u16))) {
            return self.refuse(FC_READ_HOLDING_REGISTERS);
        }
        if let Some(code) = span.clone().find_map(|a| self.exceptions.get(&(a as u16))) {
            return self.exception(FC_READ_HOLDING_REGISTERS, *code);
        }

        let mut frame = vec![self.slave_id, FC_READ_HOLDING_REGISTERS, (count * 2) as u8];
        for address in span {
            let word = self.registers.get(&(address as u16)).copied().unwrap_or(0);
            frame.extend_from_slice(&word.to_be_bytes());
        }
        with_crc(frame)
    }

    fn write(&mut self, address: u16, value: u16) -> Vec<u8> {
        if self.unsupported.contains(&address) {
            return self.refuse(FC_WRITE_SINGLE_REGISTER);
        }
        if address == PASSWORD_REGISTER {
            if self.password.map_or(true, |password| password == value) {
                self.unlocked = true;
            } else {
                self.unlocked = false;
                return self.exception(FC_WRITE_SINGLE_REGISTER, EXCEPTION_PASSWORD_ERROR);
            }
        } else if is_protected_address(address) && self.password.is_some() && !self.unlocked {
            return self.exception(FC_WRITE_SINGLE_REGISTER, EXCEPTION_PASSWORD_PROTECTION);
        }
        if self.read_only.contains(&address) {
            return self.exception(FC_WRITE_SINGLE_REGISTER, EXCEPTION_READ_ONLY);
        }
        if let Some(code) = self.exceptions.get(&address) {
            return self.exception(FC_WRITE_SINGLE_REGISTER, *code);
        }

        self.registers.insert(address, value);
        let mut frame = vec![self.slave_id, FC_WRITE_SINGLE_REGISTER];
        frame.extend_from_slice(&address.to_be_bytes());
        frame.extend_from_slice(&value.to_be_bytes());
        with_crc(frame)
    }

    fn drop_link(&mut self, reason: &str) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.unlocked = false;
        self.pending.clear();
        if let Some(events) = self.events.take() {
            let _ = events.send(LinkEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }
}

fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Simulated inverter reachable through [`RadioLink`].
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
    wake: Arc<Notify>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_slave_id(self, slave_id: u8) -> Self {
        self.state().slave_id = slave_id;
        self
    }

    pub fn with_framing(self, framing: LinkFraming) -> Self {
        self.state().framing = framing;
        self
    }

    pub fn with_register(self, address: u16, value: u16) -> Self {
        self.set_register(address, value);
        self
    }

    pub fn with_registers(self, start: u16, values: &[u16]) -> Self {
        {
            let mut state = self.state();
            for (offset, &value) in values.iter().enumerate() {
                state.registers.insert(start.wrapping_add(offset as u16), value);
            }
        }
        self
    }

    pub fn with_unsupported(self, address: u16) -> Self {
        self.state().unsupported.insert(address);
        self
    }

    pub fn with_refusal(self, refusal: RefusalStyle) -> Self {
        self.state().refusal = refusal;
        self
    }

    pub fn with_read_only(self, address: u16) -> Self {
        self.state().read_only.insert(address);
        self
    }

    /// Largest span the device answers; longer reads get exception 0x0A.
    pub fn with_max_batch(self, count: u16) -> Self {
        self.state().max_batch = count;
        self
    }

    pub fn with_password(self, password: u16) -> Self {
        self.state().password = Some(password);
        self
    }

    pub fn with_response_delay(self, delay: Duration) -> Self {
        self.state().response_delay = delay;
        self
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state().registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.state().registers.get(&address).copied()
    }

    /// Answer any request touching `address` with exception `code`.
    pub fn inject_exception(&self, address: u16, code: u8) {
        self.state().exceptions.insert(address, code);
    }

    pub fn clear_exception(&self, address: u16) {
        self.state().exceptions.remove(&address);
    }

    pub fn set_response_delay(&self, delay: Duration) {
        self.state().response_delay = delay;
    }

    pub fn set_status(&self, status: &[u8]) {
        self.state().status = Bytes::copy_from_slice(status);
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_connects(&self, count: u32) {
        self.state().fail_connects = count;
    }

    /// Acknowledge writes but never answer while set.
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    /// Swallow the next `count` responses.
    pub fn drop_responses(&self, count: u32) {
        self.state().drop_responses = count;
    }

    /// Flip the CRC of the next `count` responses.
    pub fn corrupt_responses(&self, count: u32) {
        self.state().corrupt_responses = count;
    }

    /// Drop the link from the device side and report it.
    /// Fail the next `count` status reads.
    pub fn fail_status_reads(&self, count: u32) {
        self.state().fail_status_reads = count;
    }

    /// Leave status reads hanging until cleared.
    pub fn stall_status_reads(&self, stall: bool) {
        self.state().stall_status_reads = stall;
    }

    pub fn drop_link(&self, reason: &str) {
        self.state().drop_link(reason);
        self.wake.notify_waiters();
    }

    pub fn connect_count(&self) -> u32 {
        self.state().connects
    }

    pub fn request_count(&self) -> usize {
        self.state().requests.len()
    }

    /// `(start, count)` of every read received, in order.
    pub fn reads(&self) -> Vec<(u16, u16)> {
        self.state().reads.clone()
    }

    pub fn is_unlocked(&self) -> bool {
        self.state().unlocked
    }

    pub fn clear_log(&self) {
        let mut state = self.state();
        state.requests.clear();
        state.reads.clear();
    }
}

impl RadioLink for SimulatedDevice {
    async fn connect(&mut self, address: &str, events: LinkEventSender) -> ModbusResult<()> {
        let mut state = self.state();
        state.connects += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(ModbusError::connection(format!("{} not reachable", address)));
        }
        debug!("Simulated device {} connected", address);
        state.connected = true;
        state.unlocked = false;
        state.pending.clear();
        state.events = Some(events);
        Ok(())
    }

    async fn disconnect(&mut self) {
        {
            let mut state = self.state();
            state.connected = false;
            state.unlocked = false;
            state.pending.clear();
            state.events = None;
        }
        self.wake.notify_waiters();
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn write_with_ack(&mut self, data: &[u8]) -> ModbusResult<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(ModbusError::NotConnected);
        }
        state.requests.push(data.to_vec());
        let mut response = state.handle(data);

        if state.silent {
            return Ok(());
        }
        if state.drop_responses > 0 {
            state.drop_responses -= 1;
            return Ok(());
        }
        if state.corrupt_responses > 0 && response.len() > 2 {
            state.corrupt_responses -= 1;
            let last = response.len() - 1;
            response[last] ^= 0xFF;
        }

        let mut notification = state.framing.header.clone();
        notification.extend_from_slice(&response);
        let ready_at = Instant::now() + state.response_delay;
        state.pending.push_back((ready_at, Bytes::from(notification)));
        drop(state);
        self.wake.notify_waiters();
        Ok(())
    }

    async fn read_status(&mut self) -> ModbusResult<Bytes> {
        {
            let mut state = self.state();
            if !state.connected {
                return Err(ModbusError::NotConnected);
            }
            if state.fail_status_reads > 0 {
                state.fail_status_reads -= 1;
                return Err(ModbusError::connection("status read failed"));
            }
            if !state.stall_status_reads {
                return Ok(state.status.clone());
            }
        }
        std::future::pending().await
    }

    async fn next_notification(&mut self) -> Option<Bytes> {
        loop {
            let wake = self.wake.notified();
            let ready_at = {
                let mut state = self.state();
                if !state.connected {
                    return None;
                }
                match state.pending.front() {
                    Some((at, _)) if *at <= Instant::now() => {
                        return state.pending.pop_front().map(|(_, data)| data);
                    }
                    Some((at, _)) => Some(*at),
                    None => None,
                }
            };
            match ready_at {
                Some(at) => {
                    tokio::select! {
                        _ = wake => {}
                        _ = sleep_until(at) => {}
                    }
                }
                None => wake.await,
            }
        }
    }

    fn drain_notifications(&mut self) -> usize {
        let mut state = self.state();
        let stale = state.pending.len();
        state.pending.clear();
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameCodec, Response};
    use crate::RegisterAddress;
    use tokio::sync::mpsc;

    async fn connected(device: &SimulatedDevice) -> (SimulatedDevice, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut link = device.clone();
        link.connect("sim", tx).await.unwrap();
        (link, rx)
    }

    async fn roundtrip(link: &mut SimulatedDevice, request: &[u8]) -> Response {
        link.write_with_ack(request).await.unwrap();
        let raw = link.next_notification().await.unwrap();
        FrameCodec::default().decode(&raw).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_registers() {
        let device = SimulatedDevice::new().with_registers(0x0100, &[2400, 65500]);
        let (mut link, _rx) = connected(&device).await;
        let mut codec = FrameCodec::default();
        let request = codec.build_read(RegisterAddress::from(0x0100), 2).unwrap();

        let response = roundtrip(&mut link, &request).await;
        assert_eq!(response, Response::Registers(vec![2400, 65500]));
        assert_eq!(device.reads(), vec![(0x0100, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_address_refused() {
        let device = SimulatedDevice::new().with_unsupported(0x0102);
        let (mut link, _rx) = connected(&device).await;
        let mut codec = FrameCodec::default();

        let request = codec.build_read(RegisterAddress::from(0x0100), 4).unwrap();
        assert_eq!(roundtrip(&mut link, &request).await, Response::Unsupported);

        device.state().refusal = RefusalStyle::IllegalAddress;
        match roundtrip(&mut link, &request).await {
            Response::Exception { code, .. } => assert!(code.marks_unsupported()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_password_gate() {
        let device = SimulatedDevice::new().with_password(1234);
        let (mut link, _rx) = connected(&device).await;
        let mut codec = FrameCodec::default();

        let protected = codec.build_write(RegisterAddress::from(0xE050), 7).unwrap();
        assert!(matches!(
            roundtrip(&mut link, &protected).await,
            Response::Exception { .. }
        ));

        let unlock = codec.build_write(RegisterAddress::from(PASSWORD_REGISTER), 1234).unwrap();
        assert!(roundtrip(&mut link, &unlock).await.is_success());
        assert!(roundtrip(&mut link, &protected).await.is_success());
        assert_eq!(device.register(0xE050), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_link_reports_event() {
        let device = SimulatedDevice::new();
        let (mut link, mut rx) = connected(&device).await;

        device.drop_link("out of range");
        assert!(!link.is_connected());
        assert!(link.next_notification().await.is_none());
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Disconnected {
                reason: "out of range".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connects() {
        let device = SimulatedDevice::new();
        device.fail_connects(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut link = device.clone();
        assert!(link.connect("sim", tx.clone()).await.is_err());
        assert!(link.connect("sim", tx).await.is_ok());
        assert_eq!(device.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_read_rejected() {
        let device = SimulatedDevice::new().with_max_batch(8);
        let (mut link, _rx) = connected(&device).await;
        let request = FrameCodec::default()
            .build_read(RegisterAddress::from(0), 9)
            .unwrap();
        match roundtrip(&mut link, &request).await {
            Response::Exception { code, .. } => assert_eq!(code.code(), EXCEPTION_LENGTH_ERROR),
            other => panic!("unexpected {:?}", other),
        }
    }
}
