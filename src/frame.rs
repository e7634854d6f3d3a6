//! # Modbus RTU Frames
//!
//! Building requests and decoding responses as they travel through the BLE
//! bridge.
//!
//! ## Wire Format
//!
//! | Frame | Layout |
//! |-------|--------|
//! | Read request | `[slave][0x03][addr BE][count BE][crc LE]` |
//! | Read response | `[slave][0x03][byte count][words BE...][crc LE]` |
//! | Write request/echo | `[slave][0x06][addr BE][value BE][crc LE]` |
//! | Exception | `[slave][fc \| 0x80][code][crc LE]` |
//!
//! Notifications may carry an 8-byte link-layer prefix, which is stripped
//! first. A run of sentinel bytes is the bridge's way of refusing a span; it
//! is recognised before CRC validation because the sentinel carries no CRC.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::address::RegisterAddress;
use crate::config::LinkFraming;
use crate::constants::*;
use crate::crc::CrcEngine;
use crate::error::{ModbusError, ModbusResult};
use crate::exception::ExceptionCode;
use crate::logging::format_hex_packet;

/// A parsed RTU frame with a verified CRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub slave_id: u8,
    pub function: u8,
    /// Bytes between the function code and the CRC.
    pub payload: Bytes,
    pub crc: u16,
}

impl Frame {
    /// Exception responses have the high bit of the function code set.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.function & EXCEPTION_FLAG != 0
    }

    /// Exception code of an error frame.
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_error() {
            self.payload.first().copied()
        } else {
            None
        }
    }

    /// Function code without the exception flag.
    #[inline]
    pub fn base_function(&self) -> u8 {
        self.function & !EXCEPTION_FLAG
    }

    pub fn function_description(fc: u8) -> &'static str {
        match fc & !EXCEPTION_FLAG {
            FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
            FC_WRITE_SINGLE_REGISTER => "Write Single Register",
            _ => "Unknown Function",
        }
    }
}

/// Fluent request builder; the CRC is appended by [`FrameBuilder::finish`].
#[derive(Debug)]
pub struct FrameBuilder {
    buf: BytesMut,
}

impl FrameBuilder {
    #[inline]
    pub fn new(slave_id: u8) -> Self {
        let mut buf = BytesMut::with_capacity(REQUEST_FRAME_LEN);
        buf.put_u8(slave_id);
        Self { buf }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> Self {
        self.buf.put_u8(fc);
        self
    }

    #[inline]
    pub fn address(mut self, address: RegisterAddress) -> Self {
        self.buf.put_u16(address.value());
        self
    }

    #[inline]
    pub fn word(mut self, value: u16) -> Self {
        self.buf.put_u16(value);
        self
    }

    /// Append the CRC trailer and freeze the frame.
    pub fn finish(mut self, crc: &mut CrcEngine) -> Bytes {
        let trailer = crc.trailer(&self.buf);
        self.buf.put_slice(&trailer);
        let frame = self.buf.freeze();
        debug!(
            "Frame built: FC={:02X} ({}), {}",
            frame[1],
            Frame::function_description(frame[1]),
            format_hex_packet(&frame)
        );
        frame
    }
}

/// Meaning of a decoded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// FC03 answer; words are indexed by offset from the request start.
    Registers(Vec<u16>),
    /// FC06 echo.
    WriteEcho { address: u16, value: u16 },
    /// Device rejected the request.
    Exception { function: u8, code: ExceptionCode },
    /// Vendor sentinel: the span contains an address the device refuses.
    Unsupported,
}

impl Response {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Registers(_) | Response::WriteEcho { .. })
    }
}

/// Request builder and response decoder bound to one slave and framing.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    slave_id: u8,
    framing: LinkFraming,
    crc: CrcEngine,
}

impl FrameCodec {
    pub fn new(slave_id: u8, framing: LinkFraming) -> Self {
        Self {
            slave_id,
            framing,
            crc: CrcEngine::new(),
        }
    }

    #[inline]
    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    #[inline]
    pub fn framing(&self) -> &LinkFraming {
        &self.framing
    }

    /// FC03 request for `count` registers from `address`.
    pub fn build_read(&mut self, address: RegisterAddress, count: u16) -> ModbusResult<Bytes> {
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(ModbusError::invalid_data(format!(
                "register count {} outside 1..={}",
                count, MAX_READ_REGISTERS
            )));
        }
        address.span_end(count)?;
        Ok(FrameBuilder::new(self.slave_id)
            .function_code(FC_READ_HOLDING_REGISTERS)
            .address(address)
            .word(count)
            .finish(&mut self.crc))
    }

    /// FC06 request writing `value` to `address`.
    pub fn build_write(&mut self, address: RegisterAddress, value: u16) -> ModbusResult<Bytes> {
        Ok(FrameBuilder::new(self.slave_id)
            .function_code(FC_WRITE_SINGLE_REGISTER)
            .address(address)
            .word(value)
            .finish(&mut self.crc))
    }

    /// True when `data` (with or without the link prefix) is the vendor sentinel.
    pub fn is_sentinel(&self, data: &[u8]) -> bool {
        self.framing.is_sentinel(data) || self.framing.is_sentinel(self.framing.strip_header(data))
    }

    /// Split a notification into a CRC-verified frame.
    ///
    /// Trailing bytes after the frame length implied by the function code are
    /// ignored; the bridge pads some notifications.
    pub fn parse(&mut self, data: &[u8]) -> ModbusResult<Frame> {
        let raw = self.framing.strip_header(data);
        if raw.len() < MIN_FRAME_LEN {
            return Err(ModbusError::frame(format!(
                "frame too short: {} bytes (min {})",
                raw.len(),
                MIN_FRAME_LEN
            )));
        }

        let function = raw[1];
        let frame_len = if function & EXCEPTION_FLAG != 0 {
            MIN_FRAME_LEN
        } else {
            match function {
                FC_READ_HOLDING_REGISTERS => 3 + raw[2] as usize + CRC_LEN,
                FC_WRITE_SINGLE_REGISTER => REQUEST_FRAME_LEN,
                _ => raw.len(),
            }
        };
        if raw.len() < frame_len {
            return Err(ModbusError::frame(format!(
                "truncated frame: {} bytes, expected {}",
                raw.len(),
                frame_len
            )));
        }

        let body = &raw[..frame_len - CRC_LEN];
        let actual = u16::from_le_bytes([raw[frame_len - 2], raw[frame_len - 1]]);
        let expected = self.crc.calculate(body);
        if actual != expected {
            warn!(
                "CRC mismatch: expected 0x{:04X}, got 0x{:04X} in {}",
                expected,
                actual,
                format_hex_packet(raw)
            );
            return Err(ModbusError::Crc { expected, actual });
        }

        if raw[0] != self.slave_id {
            debug!(
                "Response from slave {} while talking to slave {}",
                raw[0], self.slave_id
            );
        }

        Ok(Frame {
            slave_id: raw[0],
            function,
            payload: Bytes::copy_from_slice(&body[2..]),
            crc: actual,
        })
    }

    /// Decode a notification into a [`Response`].
    pub fn decode(&mut self, data: &[u8]) -> ModbusResult<Response> {
        if self.is_sentinel(data) {
            debug!("Sentinel response: {}", format_hex_packet(data));
            return Ok(Response::Unsupported);
        }

        let frame = self.parse(data)?;

        if let Some(code) = frame.exception_code() {
            let code = ExceptionCode::from_code(code);
            debug!(
                "Exception response: FC={:02X} ({}), code {}",
                frame.base_function(),
                Frame::function_description(frame.function),
                code
            );
            return Ok(Response::Exception {
                function: frame.base_function(),
                code,
            });
        }

        match frame.function {
            FC_READ_HOLDING_REGISTERS => {
                let byte_count = frame.payload[0] as usize;
                if byte_count % 2 != 0 {
                    return Err(ModbusError::invalid_data(format!(
                        "odd byte count {} in read response",
                        byte_count
                    )));
                }
                let words = frame.payload[1..1 + byte_count]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect::<Vec<_>>();
                debug!("Read response: {} registers", words.len());
                Ok(Response::Registers(words))
            }
            FC_WRITE_SINGLE_REGISTER => {
                let p = &frame.payload;
                Ok(Response::WriteEcho {
                    address: u16::from_be_bytes([p[0], p[1]]),
                    value: u16::from_be_bytes([p[2], p[3]]),
                })
            }
            other => Err(ModbusError::InvalidFunction { code: other }),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_SLAVE_ID, LinkFraming::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc16;

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(body).to_le_bytes());
        frame
    }

    fn with_header(frame: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 8];
        data.extend_from_slice(frame);
        data
    }

    #[test]
    fn test_build_read() {
        let mut codec = FrameCodec::default();
        let frame = codec.build_read(RegisterAddress::from(0x0100), 4).unwrap();
        assert_eq!(
            frame.as_ref(),
            &[0x01, 0x03, 0x01, 0x00, 0x00, 0x04, 0x45, 0xF5]
        );
    }

    #[test]
    fn test_build_read_validates_count() {
        let mut codec = FrameCodec::default();
        assert!(codec.build_read(RegisterAddress::from(0), 0).is_err());
        assert!(codec.build_read(RegisterAddress::from(0), 126).is_err());
        assert!(codec.build_read(RegisterAddress::from(0), 125).is_ok());
        assert!(codec.build_read(RegisterAddress::from(0xFFFF), 2).is_err());
    }

    #[test]
    fn test_build_write() {
        let mut codec = FrameCodec::default();
        let frame = codec.build_write(RegisterAddress::from(0xE203), 4321).unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(&frame[..6], &[0x01, 0x06, 0xE2, 0x03, 0x10, 0xE1]);
        assert_eq!(&frame[6..], &crc16(&frame[..6]).to_le_bytes());
    }

    #[test]
    fn test_decode_read_response_with_header() {
        let mut codec = FrameCodec::default();
        let frame = with_crc(&[0x01, 0x03, 0x04, 0x09, 0x60, 0xFF, 0xDC]);
        let response = codec.decode(&with_header(&frame)).unwrap();
        assert_eq!(response, Response::Registers(vec![2400, 65500]));

        // Without the prefix as well.
        let response = codec.decode(&frame).unwrap();
        assert_eq!(response, Response::Registers(vec![2400, 65500]));
    }

    #[test]
    fn test_decode_ignores_trailing_padding() {
        let mut codec = FrameCodec::default();
        let mut frame = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        frame.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(codec.decode(&frame).unwrap(), Response::Registers(vec![42]));
    }

    #[test]
    fn test_decode_sentinel_before_crc() {
        let mut codec = FrameCodec::default();
        assert_eq!(codec.decode(&[0x2D; 4]).unwrap(), Response::Unsupported);
        assert_eq!(
            codec.decode(&with_header(&[0x2D; 6])).unwrap(),
            Response::Unsupported
        );
        // Three bytes are not enough.
        assert!(codec.decode(&[0x2D, 0x2D, 0x2D]).is_err());
    }

    #[test]
    fn test_decode_crc_mismatch() {
        let mut codec = FrameCodec::default();
        let mut frame = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            codec.decode(&frame),
            Err(ModbusError::Crc { .. })
        ));
    }

    #[test]
    fn test_decode_exception() {
        let mut codec = FrameCodec::default();
        let frame = with_crc(&[0x01, 0x83, 0x02]);
        assert_eq!(
            codec.decode(&frame).unwrap(),
            Response::Exception {
                function: 0x03,
                code: ExceptionCode::IllegalDataAddress
            }
        );

        let parsed = codec.parse(&frame).unwrap();
        assert!(parsed.is_error());
        assert_eq!(parsed.exception_code(), Some(0x02));
    }

    #[test]
    fn test_decode_write_echo() {
        let mut codec = FrameCodec::default();
        let frame = with_crc(&[0x01, 0x06, 0xE2, 0x03, 0x10, 0xE1]);
        assert_eq!(
            codec.decode(&frame).unwrap(),
            Response::WriteEcho {
                address: 0xE203,
                value: 4321
            }
        );
    }

    #[test]
    fn test_decode_malformed() {
        let mut codec = FrameCodec::default();
        assert!(matches!(
            codec.decode(&[0x01, 0x03]),
            Err(ModbusError::Frame { .. })
        ));

        // Byte count claims more data than present.
        let frame = with_crc(&[0x01, 0x03, 0x08, 0x00, 0x01]);
        assert!(matches!(
            codec.decode(&frame),
            Err(ModbusError::Frame { .. })
        ));

        // Odd byte count.
        let frame = with_crc(&[0x01, 0x03, 0x03, 0x00, 0x01, 0x02]);
        assert!(matches!(
            codec.decode(&frame),
            Err(ModbusError::InvalidData { .. })
        ));

        let frame = with_crc(&[0x01, 0x10, 0x00, 0x01]);
        assert_eq!(
            codec.decode(&frame),
            Err(ModbusError::InvalidFunction { code: 0x10 })
        );
    }
}
