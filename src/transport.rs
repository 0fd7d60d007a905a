//! RS-485 Transport (C3): half-duplex framed line I/O over a serial port
//! (spec §4.2). Frame grammar, outbound command templates, and the
//! lossy-decode / buffer-clear discipline are grounded on
//! `original_source/monitor_industrial/monitor_rs485.py`; the async port
//! itself uses `tokio-serial` so the reader composes with `tokio::select!`
//! alongside the rest of the engine's channels (spec §5), the way the
//! teacher's own tasks in `main.rs` cooperate on one runtime.

use crate::error::TransportError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

/// Settle delay after raising the DE/RE direction line and before lowering
/// it, matching the source's fixed inter-byte pause on write.
const WRITE_SETTLE_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Cont,
    Total,
    Meta,
    Estado,
    Reset,
    Log,
    Heartbeat,
    Inactivo,
    Fin,
}

impl FrameTag {
    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "CONT" => Some(FrameTag::Cont),
            "TOTAL" => Some(FrameTag::Total),
            "META" => Some(FrameTag::Meta),
            "ESTADO" => Some(FrameTag::Estado),
            "RESET" => Some(FrameTag::Reset),
            "LOG" => Some(FrameTag::Log),
            "HEARTBEAT" => Some(FrameTag::Heartbeat),
            "INACTIVO" => Some(FrameTag::Inactivo),
            "FIN" => Some(FrameTag::Fin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub device_id: String,
    pub tag: FrameTag,
    pub value: i32,
}

/// Parses one line of the form `DEVICEID:TAG:VALUE`. `DEVICEID` must be
/// `[A-Z0-9]{1,8}`; `VALUE` a signed 32-bit decimal integer.
pub fn parse_frame(line: &str) -> Result<Frame, TransportError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.splitn(3, ':');
    let device_id = parts
        .next()
        .ok_or_else(|| TransportError::ParseError(line.to_string()))?;
    let tag = parts
        .next()
        .ok_or_else(|| TransportError::ParseError(line.to_string()))?;
    let value = parts
        .next()
        .ok_or_else(|| TransportError::ParseError(line.to_string()))?;

    if device_id.is_empty()
        || device_id.len() > 8
        || !device_id.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return Err(TransportError::ParseError(line.to_string()));
    }
    let tag = FrameTag::parse(tag).ok_or_else(|| TransportError::ParseError(line.to_string()))?;
    let value: i32 = value
        .parse()
        .map_err(|_| TransportError::ParseError(line.to_string()))?;

    Ok(Frame {
        device_id: device_id.to_string(),
        tag,
        value,
    })
}

/// One of the six outbound command templates the orchestrator sends to a
/// device (spec §4.3, §6).
pub enum OutboundCommand {
    Activar { product_code: String },
    Desactivar,
    Meta { quantity: i64 },
    Reset,
    Pausar,
    Reanudar,
}

impl OutboundCommand {
    pub fn to_frame_text(&self, device_id: &str) -> String {
        match self {
            OutboundCommand::Activar { product_code } => {
                format!("{device_id}:ACTIVAR:{product_code}")
            }
            OutboundCommand::Desactivar => format!("{device_id}:DESACTIVAR:0"),
            OutboundCommand::Meta { quantity } => format!("{device_id}:META:{quantity}"),
            OutboundCommand::Reset => format!("{device_id}:RESET:0"),
            OutboundCommand::Pausar => format!("{device_id}:PAUSAR:0"),
            OutboundCommand::Reanudar => format!("{device_id}:REANUDAR:0"),
        }
    }
}

pub struct Rs485Transport {
    port: SerialStream,
    // Bytes read from the port but not yet consumed as a complete line.
    pending: Vec<u8>,
}

impl Rs485Transport {
    pub fn open(port: &str, baud: u32) -> Result<Self, TransportError> {
        let stream = tokio_serial::new(port, baud)
            .open_native_async()
            .map_err(|e| TransportError::PortLost(e.to_string()))?;
        Ok(Self {
            port: stream,
            pending: Vec::new(),
        })
    }

    /// Reads one complete line with a lossy UTF-8 decode — invalid byte
    /// sequences are replaced rather than treated as fatal, matching the
    /// source's `errors='ignore'` decoding policy. Malformed lines surface
    /// as `ParseError` but never end the session.
    pub async fn read_frame(&mut self, deadline: Duration) -> Result<Frame, TransportError> {
        timeout(deadline, self.read_line())
            .await
            .map_err(|_| TransportError::Timeout)?
            .and_then(|line| parse_frame(&line))
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(String::from_utf8_lossy(&line).to_string());
            }
            let mut chunk = [0u8; 256];
            let n = self
                .port
                .read(&mut chunk)
                .await
                .map_err(|e| TransportError::PortLost(e.to_string()))?;
            if n == 0 {
                return Err(TransportError::PortLost("port closed".to_string()));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Raises the DE/RE direction line, writes the bytes with a trailing
    /// newline, waits the settle delay, then lowers the line. Callers must
    /// serialise access themselves (spec: "only one caller at a time" is an
    /// exclusive write lock held by the Orchestrator around this call).
    pub async fn write_frame(&mut self, text: &str) -> Result<(), TransportError> {
        self.port
            .write_request_to_send(true)
            .map_err(|e| TransportError::PortLost(e.to_string()))?;

        let mut line = text.as_bytes().to_vec();
        line.push(b'\n');
        self.port
            .write_all(&line)
            .await
            .map_err(|e| TransportError::PortLost(e.to_string()))?;
        self.port
            .flush()
            .await
            .map_err(|e| TransportError::PortLost(e.to_string()))?;

        tokio::time::sleep(WRITE_SETTLE_DELAY).await;

        self.port
            .write_request_to_send(false)
            .map_err(|e| TransportError::PortLost(e.to_string()))?;
        Ok(())
    }

    /// Discards bytes queued in the port's input/output buffers plus any
    /// partially-buffered line not yet delivered to a reader. Used after
    /// reopening the port following a `PortLost` error, mirroring the
    /// source's buffer-clear step on reconnect.
    pub fn clear_buffers(&mut self) -> Result<(), TransportError> {
        self.port
            .clear(ClearBuffer::All)
            .map_err(|e| TransportError::PortLost(e.to_string()))?;
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_cont_frame() {
        let frame = parse_frame("EST01:CONT:42\n").unwrap();
        assert_eq!(frame.device_id, "EST01");
        assert_eq!(frame.tag, FrameTag::Cont);
        assert_eq!(frame.value, 42);
    }

    #[test]
    fn parses_negative_value() {
        let frame = parse_frame("A1:INACTIVO:-5").unwrap();
        assert_eq!(frame.value, -5);
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(parse_frame("EST01:BOGUS:1").is_err());
    }

    #[test]
    fn rejects_device_id_too_long() {
        assert!(parse_frame("ABCDEFGHI:CONT:1").is_err());
    }

    #[test]
    fn rejects_lowercase_device_id() {
        assert!(parse_frame("est01:CONT:1").is_err());
    }

    #[test]
    fn rejects_non_integer_value() {
        assert!(parse_frame("EST01:CONT:abc").is_err());
    }

    #[test]
    fn outbound_command_templates_match_wire_format() {
        assert_eq!(
            OutboundCommand::Activar {
                product_code: "P100".to_string()
            }
            .to_frame_text("7"),
            "7:ACTIVAR:P100"
        );
        assert_eq!(OutboundCommand::Desactivar.to_frame_text("7"), "7:DESACTIVAR:0");
        assert_eq!(
            OutboundCommand::Meta { quantity: 10 }.to_frame_text("7"),
            "7:META:10"
        );
        assert_eq!(OutboundCommand::Reset.to_frame_text("7"), "7:RESET:0");
        assert_eq!(OutboundCommand::Pausar.to_frame_text("7"), "7:PAUSAR:0");
        assert_eq!(OutboundCommand::Reanudar.to_frame_text("7"), "7:REANUDAR:0");
    }
}
