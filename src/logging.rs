//! Packet logging helpers.
//!
//! The crate only emits `tracing` events; installing a subscriber is up to
//! the host (the demo binary uses `tracing-subscriber`). [`LoggingMode`]
//! controls how much of each exchange the transport writes out.

use tracing::{debug, info};

/// How much of each exchange the transport logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    /// Summary lines only.
    #[default]
    Quiet,
    /// Every TX/RX frame as hex at debug level.
    Packets,
    /// Every TX/RX frame as hex at info level.
    Verbose,
}

/// Format raw bytes as a space separated hex string.
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log one frame with its direction.
pub fn log_packet(mode: LoggingMode, direction: &str, data: &[u8]) {
    match mode {
        LoggingMode::Quiet => {}
        LoggingMode::Packets => debug!("[BLE] {} {}", direction, format_hex_packet(data)),
        LoggingMode::Verbose => info!("[BLE] {} {}", direction, format_hex_packet(data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hex_packet() {
        assert_eq!(format_hex_packet(&[0x01, 0x03, 0xAB]), "01 03 AB");
        assert_eq!(format_hex_packet(&[]), "");
    }
}
