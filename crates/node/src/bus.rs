//! RS-485 bus protocol: framing, command decoding, response encoding.
//!
//! Frames are single ASCII lines carrying a CRC-16/MODBUS over the payload:
//!
//! ```text
//! host → node   >Sprinkler1 open 2 60000*1A2B\n
//! node → host   <Sprinkler1 ack open 2*3C4D\n
//! ```
//!
//! Anything that fails to frame, checksum or parse is bus noise: it is
//! counted and dropped here and never reaches the control loop.  Frames for
//! other addresses are ordinary traffic and are skipped without comment.

use std::collections::VecDeque;
use std::fmt;

use crc::{Crc, CRC_16_MODBUS};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::{FrameError, TransportError, ValveError};
use crate::status::StatusSnapshot;
use crate::store::ParamId;
use crate::valve::ValveStatus;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Longest inbound line accepted, start byte and checksum included.
pub const MAX_FRAME_LEN: usize = 96;

/// Assembler capacity: a full-length frame plus the tolerated `\r`.
pub const LINE_CAPACITY: usize = MAX_FRAME_LEN + 1;

/// Bound on bytes pulled from the transport in a single cycle.
pub const MAX_BYTES_PER_CYCLE: usize = 128;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// 1-based valve number as used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ValveId(pub u8);

impl ValveId {
    pub fn from_index(index: usize) -> Self {
        Self(index as u8 + 1)
    }

    /// Array index, or `None` for valve 0.
    pub fn index(self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }
}

impl fmt::Display for ValveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorId {
    Temperature,
    Humidity,
    Leak,
}

impl SensorId {
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "temperature" => Some(Self::Temperature),
            "humidity" => Some(Self::Humidity),
            "leak" => Some(Self::Leak),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Leak => "leak",
        }
    }
}

// ---------------------------------------------------------------------------
// Commands and responses
// ---------------------------------------------------------------------------

/// A decoded request from the host.  Durations stay signed so that a
/// negative value reaches validation and earns a NAK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ReadSensor(SensorId),
    ReadValve(ValveId),
    Status,
    OpenValve { valve: ValveId, duration_ms: i64 },
    CloseValve(ValveId),
    SetParam { param: ParamId, value: i64 },
    ClearAlarm,
    SilenceAlarm { duration_ms: i64 },
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::ReadSensor(_) => "read",
            Self::ReadValve(_) => "valve",
            Self::Status => "status",
            Self::OpenValve { .. } => "open",
            Self::CloseValve(_) => "close",
            Self::SetParam { .. } => "set",
            Self::ClearAlarm => "clear",
            Self::SilenceAlarm { .. } => "silence",
        }
    }

    fn parse(tokens: &[&str]) -> Result<Self, FrameError> {
        let Some((verb, args)) = tokens.split_first() else {
            return Err(FrameError::Malformed("no verb"));
        };

        let cmd = match (verb.to_ascii_lowercase().as_str(), args) {
            ("read", [sensor]) => Self::ReadSensor(
                SensorId::parse(sensor).ok_or(FrameError::Malformed("unknown sensor"))?,
            ),
            ("valve", [n]) => Self::ReadValve(parse_valve(n)?),
            ("status", []) => Self::Status,
            ("open", [n, ms]) => Self::OpenValve {
                valve: parse_valve(n)?,
                duration_ms: parse_number(ms)?,
            },
            ("close", [n]) => Self::CloseValve(parse_valve(n)?),
            ("set", [param, value]) => Self::SetParam {
                param: ParamId::parse(param).ok_or(FrameError::Malformed("unknown parameter"))?,
                value: parse_number(value)?,
            },
            ("clear", []) => Self::ClearAlarm,
            ("silence", [ms]) => Self::SilenceAlarm {
                duration_ms: parse_number(ms)?,
            },
            ("read" | "valve" | "status" | "open" | "close" | "set" | "clear" | "silence", _) => {
                return Err(FrameError::Malformed("wrong argument count"))
            }
            _ => return Err(FrameError::Malformed("unknown verb")),
        };
        Ok(cmd)
    }
}

fn parse_valve(token: &str) -> Result<ValveId, FrameError> {
    token
        .parse::<u8>()
        .map(ValveId)
        .map_err(|_| FrameError::Malformed("bad valve number"))
}

fn parse_number(token: &str) -> Result<i64, FrameError> {
    token
        .parse::<i64>()
        .map_err(|_| FrameError::Malformed("bad number"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakReason {
    InvalidDuration,
    UnknownValve,
    InvalidValue,
    Storage,
}

impl NakReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidDuration => "invalid-duration",
            Self::UnknownValve => "unknown-valve",
            Self::InvalidValue => "invalid-value",
            Self::Storage => "storage",
        }
    }
}

impl From<&ValveError> for NakReason {
    fn from(e: &ValveError) -> Self {
        match e {
            ValveError::UnknownValve(_) => Self::UnknownValve,
            ValveError::InvalidDuration(_) => Self::InvalidDuration,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    /// `None` when the sensor has never produced a good reading.
    Reading {
        sensor: SensorId,
        value: Option<i32>,
    },
    Valve {
        valve: ValveId,
        status: ValveStatus,
        remaining_ms: Option<u32>,
    },
    Status(Box<StatusSnapshot>),
    Ack {
        verb: &'static str,
        target: Option<String>,
    },
    Nak {
        verb: &'static str,
        reason: NakReason,
    },
}

impl Response {
    /// Payload text after the address token.
    pub fn body(&self) -> String {
        match self {
            Self::Reading { sensor, value } => match value {
                Some(v) => format!("read {} {v}", sensor.as_str()),
                None => format!("read {} nodata", sensor.as_str()),
            },
            Self::Valve {
                valve,
                status: ValveStatus::Closed,
                ..
            } => format!("valve {valve} closed"),
            Self::Valve {
                valve,
                remaining_ms: Some(ms),
                ..
            } => format!("valve {valve} open {ms}"),
            Self::Valve { valve, .. } => format!("valve {valve} open hold"),
            Self::Status(snapshot) => match serde_json::to_string(snapshot) {
                Ok(json) => format!("status {json}"),
                Err(e) => {
                    warn!("status serialisation failed: {e}");
                    "status {}".to_string()
                }
            },
            Self::Ack {
                verb,
                target: Some(t),
            } => format!("ack {verb} {t}"),
            Self::Ack { verb, target: None } => format!("ack {verb}"),
            Self::Nak { verb, reason } => format!("nak {verb} {}", reason.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Who sent a frame, from its start byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `>`: host to node.
    Request,
    /// `<`: node to host.
    Reply,
}

impl Direction {
    fn from_start(b: u8) -> Option<Self> {
        match b {
            b'>' => Some(Self::Request),
            b'<' => Some(Self::Reply),
            _ => None,
        }
    }

    fn start_byte(self) -> u8 {
        match self {
            Self::Request => b'>',
            Self::Reply => b'<',
        }
    }
}

pub fn checksum(payload: &[u8]) -> u16 {
    CRC16.checksum(payload)
}

/// Build a complete frame line for `payload`.
pub fn encode_frame(direction: Direction, payload: &str) -> Vec<u8> {
    format!(
        "{}{payload}*{:04X}\n",
        direction.start_byte() as char,
        checksum(payload.as_bytes())
    )
    .into_bytes()
}

/// Validate one line (start byte up to, not including, `\n`) and return
/// its direction and payload.
pub fn unwrap_frame(line: &[u8]) -> Result<(Direction, &str), FrameError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let (&start, rest) = line
        .split_first()
        .ok_or(FrameError::Malformed("empty frame"))?;
    let direction = Direction::from_start(start).ok_or(FrameError::Malformed("no start byte"))?;

    let star = rest
        .iter()
        .rposition(|&b| b == b'*')
        .ok_or(FrameError::MissingChecksum)?;
    let (payload, tail) = (&rest[..star], &rest[star + 1..]);

    if tail.len() != 4 || !tail.iter().all(u8::is_ascii_hexdigit) {
        return Err(FrameError::MissingChecksum);
    }
    // Four ASCII hex digits, so both conversions succeed.
    let hex = std::str::from_utf8(tail).map_err(|_| FrameError::MissingChecksum)?;
    let expected = u16::from_str_radix(hex, 16).map_err(|_| FrameError::MissingChecksum)?;
    let actual = checksum(payload);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    if !payload.is_ascii() {
        return Err(FrameError::NotAscii);
    }
    let text = std::str::from_utf8(payload).map_err(|_| FrameError::NotAscii)?;
    Ok((direction, text))
}

/// Decode a request line addressed to `address`.
pub fn decode_request(line: &[u8], address: &str) -> Result<Command, FrameError> {
    let (direction, text) = unwrap_frame(line)?;
    if direction != Direction::Request {
        return Err(FrameError::ReplyFrame);
    }

    let tokens: Vec<&str> = text.split_ascii_whitespace().collect();
    let Some((&dest, rest)) = tokens.split_first() else {
        return Err(FrameError::Malformed("empty payload"));
    };
    if dest != address {
        return Err(FrameError::OtherAddress(dest.to_string()));
    }
    Command::parse(rest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssemblerState {
    /// Between frames; bytes are ignored until a start byte.
    Idle,
    Collecting,
    /// Overflowed; skip to the end of the line.
    Discarding,
}

/// Reassembles frame lines from a byte stream.
pub struct FrameAssembler {
    buf: heapless::Vec<u8, LINE_CAPACITY>,
    state: AssemblerState,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buf: heapless::Vec::new(),
            state: AssemblerState::Idle,
        }
    }

    /// Feed one byte.  Returns a result whenever a line ends (or a frame
    /// is cut short by a new start byte).  A trailing `\r` is stripped
    /// before the length limit applies.
    pub fn push(&mut self, byte: u8) -> Option<Result<heapless::Vec<u8, LINE_CAPACITY>, FrameError>> {
        match (self.state, byte) {
            (AssemblerState::Discarding, b'\n') => {
                self.state = AssemblerState::Idle;
                Some(Err(FrameError::Overflow(MAX_FRAME_LEN)))
            }
            (AssemblerState::Discarding, _) => None,
            (AssemblerState::Collecting, b'\n') => {
                self.state = AssemblerState::Idle;
                let mut line = core::mem::take(&mut self.buf);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.len() > MAX_FRAME_LEN {
                    return Some(Err(FrameError::Overflow(MAX_FRAME_LEN)));
                }
                Some(Ok(line))
            }
            (state, b'>' | b'<') => {
                let cut_short = state == AssemblerState::Collecting;
                self.buf.clear();
                // Empty buffer, cannot overflow.
                let _ = self.buf.push(byte);
                self.state = AssemblerState::Collecting;
                cut_short.then_some(Err(FrameError::Malformed("frame cut short")))
            }
            (AssemblerState::Idle, _) => None,
            (AssemblerState::Collecting, _) => {
                if self.buf.push(byte).is_err() {
                    self.buf.clear();
                    self.state = AssemblerState::Discarding;
                }
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transport port
// ---------------------------------------------------------------------------

/// Byte-level link to the transceiver.  Neither method may block.
pub trait Transport {
    /// Next received byte, or `None` if nothing is waiting.
    fn read_byte(&mut self) -> Result<Option<u8>, TransportError>;
    /// Queue a complete frame for transmission and return immediately.
    fn queue(&mut self, frame: &[u8]) -> Result<(), TransportError>;
    /// Once-per-cycle housekeeping: push queued output, release the line.
    fn service(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// In-memory transport for tests and loopback runs.
#[derive(Default)]
pub struct MemoryTransport {
    pub inbound: VecDeque<u8>,
    pub sent: Vec<Vec<u8>>,
    /// Number of `service` calls seen.
    pub serviced: usize,
}

impl MemoryTransport {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes);
    }

    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for MemoryTransport {
    fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
        Ok(self.inbound.pop_front())
    }

    fn queue(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn service(&mut self) -> Result<(), TransportError> {
        self.serviced += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub accepted: u32,
    pub dropped: u32,
    pub foreign: u32,
    pub tx_failed: u32,
}

pub struct BusAdapter<T: Transport> {
    address: String,
    transport: T,
    assembler: FrameAssembler,
    stats: BusStats,
    link_fault: bool,
}

impl<T: Transport> BusAdapter<T> {
    pub fn new(address: impl Into<String>, transport: T) -> Self {
        Self {
            address: address.into(),
            transport,
            assembler: FrameAssembler::new(),
            stats: BusStats::default(),
            link_fault: false,
        }
    }

    /// Read what is waiting (bounded per cycle) and return the first valid
    /// command addressed to this node.  Bytes after that command stay in the
    /// transport for the next cycle.
    pub fn poll(&mut self) -> Option<Command> {
        if let Err(e) = self.transport.service() {
            self.note_link_error(&e);
        }
        for _ in 0..MAX_BYTES_PER_CYCLE {
            let byte = match self.transport.read_byte() {
                Ok(Some(b)) => b,
                Ok(None) => return None,
                Err(e) => {
                    self.note_link_error(&e);
                    return None;
                }
            };
            self.link_fault = false;

            let Some(line) = self.assembler.push(byte) else {
                continue;
            };
            match line.and_then(|l| decode_request(&l, &self.address)) {
                Ok(cmd) => {
                    self.stats.accepted = self.stats.accepted.wrapping_add(1);
                    trace!(?cmd, "command received");
                    return Some(cmd);
                }
                Err(FrameError::OtherAddress(dest)) => {
                    self.stats.foreign = self.stats.foreign.wrapping_add(1);
                    trace!(%dest, "frame for another node");
                }
                Err(FrameError::ReplyFrame) => {
                    self.stats.foreign = self.stats.foreign.wrapping_add(1);
                }
                Err(e) => {
                    self.stats.dropped = self.stats.dropped.wrapping_add(1);
                    debug!("frame dropped: {e}");
                }
            }
        }
        None
    }

    fn note_link_error(&mut self, e: &TransportError) {
        if !self.link_fault {
            warn!("bus link error: {e}");
            self.link_fault = true;
        }
    }

    /// Frame and queue a response.  Transmission is not awaited.
    pub fn respond(&mut self, response: &Response) {
        let payload = format!("{} {}", self.address, response.body());
        let frame = encode_frame(Direction::Reply, &payload);
        if let Err(e) = self.transport.queue(&frame) {
            self.stats.tx_failed = self.stats.tx_failed.wrapping_add(1);
            warn!("response not queued: {e}");
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "Sprinkler1";

    fn request(payload: &str) -> Vec<u8> {
        encode_frame(Direction::Request, payload)
    }

    /// Line without its trailing newline, as the assembler hands it over.
    fn line(payload: &str) -> Vec<u8> {
        let mut f = request(payload);
        f.pop();
        f
    }

    fn decode(payload: &str) -> Result<Command, FrameError> {
        decode_request(&line(payload), ADDR)
    }

    // -- Checksum ---------------------------------------------------------

    #[test]
    fn crc16_modbus_check_value() {
        assert_eq!(checksum(b"123456789"), 0x4B37);
    }

    #[test]
    fn encode_frame_layout() {
        let f = String::from_utf8(request("Sprinkler1 status")).unwrap();
        assert!(f.starts_with(">Sprinkler1 status*"));
        assert!(f.ends_with('\n'));
        assert_eq!(f.len(), ">Sprinkler1 status*XXXX\n".len());
    }

    // -- unwrap_frame -----------------------------------------------------

    #[test]
    fn unwrap_accepts_crlf() {
        let mut l = line("Sprinkler1 clear");
        l.push(b'\r');
        assert_eq!(
            unwrap_frame(&l).unwrap(),
            (Direction::Request, "Sprinkler1 clear")
        );
    }

    #[test]
    fn unwrap_accepts_lowercase_hex() {
        let payload = "Sprinkler1 clear";
        let l = format!(">{payload}*{:04x}", checksum(payload.as_bytes()));
        assert!(unwrap_frame(l.as_bytes()).is_ok());
    }

    #[test]
    fn unwrap_rejects_bad_checksum() {
        let l = b">Sprinkler1 clear*0000";
        assert!(matches!(
            unwrap_frame(l),
            Err(FrameError::ChecksumMismatch { expected: 0, .. })
        ));
    }

    #[test]
    fn unwrap_rejects_missing_checksum() {
        assert_eq!(
            unwrap_frame(b">Sprinkler1 clear"),
            Err(FrameError::MissingChecksum)
        );
        assert_eq!(
            unwrap_frame(b">Sprinkler1 clear*+123"),
            Err(FrameError::MissingChecksum)
        );
    }

    #[test]
    fn unwrap_rejects_corrupted_payload() {
        let mut l = line("Sprinkler1 open 1 1000");
        l[15] = b'2';
        assert!(matches!(
            unwrap_frame(&l),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    // -- decode_request ---------------------------------------------------

    #[test]
    fn decode_every_command() {
        let cases = [
            ("Sprinkler1 read temperature", Command::ReadSensor(SensorId::Temperature)),
            ("Sprinkler1 read HUMIDITY", Command::ReadSensor(SensorId::Humidity)),
            ("Sprinkler1 read leak", Command::ReadSensor(SensorId::Leak)),
            ("Sprinkler1 valve 2", Command::ReadValve(ValveId(2))),
            ("Sprinkler1 status", Command::Status),
            (
                "Sprinkler1 open 1 60000",
                Command::OpenValve {
                    valve: ValveId(1),
                    duration_ms: 60_000,
                },
            ),
            ("Sprinkler1 close 3", Command::CloseValve(ValveId(3))),
            (
                "Sprinkler1 set baud 19200",
                Command::SetParam {
                    param: ParamId::BaudRate,
                    value: 19_200,
                },
            ),
            ("Sprinkler1 clear", Command::ClearAlarm),
            (
                "Sprinkler1 silence 0",
                Command::SilenceAlarm { duration_ms: 0 },
            ),
        ];
        for (payload, expected) in cases {
            assert_eq!(decode(payload), Ok(expected), "payload {payload:?}");
        }
    }

    #[test]
    fn decode_keeps_negative_duration_for_validation() {
        assert_eq!(
            decode("Sprinkler1 open 1 -5"),
            Ok(Command::OpenValve {
                valve: ValveId(1),
                duration_ms: -5
            })
        );
    }

    #[test]
    fn decode_other_address() {
        assert_eq!(
            decode("Sprinkler2 status"),
            Err(FrameError::OtherAddress("Sprinkler2".into()))
        );
    }

    #[test]
    fn decode_address_is_case_sensitive() {
        assert!(matches!(
            decode("sprinkler1 status"),
            Err(FrameError::OtherAddress(_))
        ));
    }

    #[test]
    fn decode_malformed_commands() {
        for payload in [
            "Sprinkler1",
            "Sprinkler1 dance",
            "Sprinkler1 read pressure",
            "Sprinkler1 open 1",
            "Sprinkler1 open x 100",
            "Sprinkler1 open 1 ten",
            "Sprinkler1 close 300",
            "Sprinkler1 set volume 3",
            "Sprinkler1 status now",
        ] {
            assert!(
                matches!(decode(payload), Err(FrameError::Malformed(_))),
                "payload {payload:?} should be malformed"
            );
        }
    }

    #[test]
    fn decode_rejects_reply_frames() {
        let mut l = encode_frame(Direction::Reply, "Sprinkler1 status");
        l.pop();
        assert_eq!(decode_request(&l, ADDR), Err(FrameError::ReplyFrame));
    }

    // -- FrameAssembler ---------------------------------------------------

    fn feed(asm: &mut FrameAssembler, bytes: &[u8]) -> Vec<Result<Vec<u8>, FrameError>> {
        bytes
            .iter()
            .filter_map(|&b| asm.push(b))
            .map(|r| r.map(|v| v.to_vec()))
            .collect()
    }

    #[test]
    fn assembler_yields_lines() {
        let mut asm = FrameAssembler::new();
        let mut bytes = b"noise".to_vec();
        bytes.extend(request("Sprinkler1 clear"));
        bytes.extend(request("Sprinkler1 status"));
        let out = feed(&mut asm, &bytes);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_deref().unwrap(), &line("Sprinkler1 clear")[..]);
    }

    #[test]
    fn assembler_overflow_discards_whole_line() {
        let mut asm = FrameAssembler::new();
        let mut bytes = vec![b'>'];
        bytes.extend(std::iter::repeat(b'a').take(MAX_FRAME_LEN + 10));
        bytes.push(b'\n');
        bytes.extend(request("Sprinkler1 clear"));
        let out = feed(&mut asm, &bytes);
        assert_eq!(out[0], Err(FrameError::Overflow(MAX_FRAME_LEN)));
        assert!(out[1].is_ok());
    }

    #[test]
    fn assembler_resyncs_on_new_start_byte() {
        let mut asm = FrameAssembler::new();
        let mut bytes = b">Sprinkler1 ope".to_vec();
        bytes.extend(request("Sprinkler1 clear"));
        let out = feed(&mut asm, &bytes);
        assert!(out[0].is_err());
        assert_eq!(out[1].as_deref().unwrap(), &line("Sprinkler1 clear")[..]);
    }

    /// A `status` request padded with spaces to exactly `frame_len` bytes,
    /// start byte through checksum, followed by `ending`.
    fn padded_status(frame_len: usize, ending: &[u8]) -> Vec<u8> {
        let overhead = 1 + 1 + 4; // start byte, '*', checksum
        let pad = frame_len - overhead - "Sprinkler1status".len();
        let mut f = request(&format!("Sprinkler1{}status", " ".repeat(pad)));
        f.pop();
        assert_eq!(f.len(), frame_len);
        f.extend_from_slice(ending);
        f
    }

    #[test]
    fn full_length_frame_accepted_with_either_line_ending() {
        for ending in [&b"\n"[..], &b"\r\n"[..]] {
            let mut bus = adapter();
            bus.transport_mut().feed(&padded_status(MAX_FRAME_LEN, ending));
            assert_eq!(bus.poll(), Some(Command::Status), "ending {ending:?}");
            assert_eq!(bus.stats().dropped, 0);
        }
    }

    #[test]
    fn frame_one_byte_too_long_dropped() {
        for ending in [&b"\n"[..], &b"\r\n"[..]] {
            let mut bus = adapter();
            bus.transport_mut()
                .feed(&padded_status(MAX_FRAME_LEN + 1, ending));
            assert_eq!(bus.poll(), None, "ending {ending:?}");
            assert_eq!(bus.stats().dropped, 1);
        }
    }

    // -- Response bodies --------------------------------------------------

    #[test]
    fn response_bodies() {
        let cases = [
            (
                Response::Reading {
                    sensor: SensorId::Temperature,
                    value: Some(23),
                },
                "read temperature 23",
            ),
            (
                Response::Reading {
                    sensor: SensorId::Leak,
                    value: None,
                },
                "read leak nodata",
            ),
            (
                Response::Valve {
                    valve: ValveId(1),
                    status: ValveStatus::Open,
                    remaining_ms: Some(1500),
                },
                "valve 1 open 1500",
            ),
            (
                Response::Valve {
                    valve: ValveId(2),
                    status: ValveStatus::Open,
                    remaining_ms: None,
                },
                "valve 2 open hold",
            ),
            (
                Response::Valve {
                    valve: ValveId(2),
                    status: ValveStatus::Closed,
                    remaining_ms: None,
                },
                "valve 2 closed",
            ),
            (
                Response::Ack {
                    verb: "open",
                    target: Some("1".into()),
                },
                "ack open 1",
            ),
            (
                Response::Ack {
                    verb: "clear",
                    target: None,
                },
                "ack clear",
            ),
            (
                Response::Nak {
                    verb: "set",
                    reason: NakReason::InvalidValue,
                },
                "nak set invalid-value",
            ),
        ];
        for (response, expected) in cases {
            assert_eq!(response.body(), expected);
        }
    }

    // -- BusAdapter -------------------------------------------------------

    fn adapter() -> BusAdapter<MemoryTransport> {
        BusAdapter::new(ADDR, MemoryTransport::default())
    }

    #[test]
    fn adapter_returns_one_command_per_poll() {
        let mut bus = adapter();
        bus.transport_mut().feed(&request("Sprinkler1 clear"));
        bus.transport_mut().feed(&request("Sprinkler1 status"));

        assert_eq!(bus.poll(), Some(Command::ClearAlarm));
        assert_eq!(bus.poll(), Some(Command::Status));
        assert_eq!(bus.poll(), None);
        assert_eq!(bus.stats().accepted, 2);
    }

    #[test]
    fn adapter_drops_noise_silently() {
        let mut bus = adapter();
        bus.transport_mut().feed(b">Sprinkler1 clear*0000\n");
        bus.transport_mut().feed(&request("Sprinkler1 juggle"));
        bus.transport_mut().feed(&request("Sprinkler7 clear"));
        assert_eq!(bus.poll(), None);

        let stats = bus.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.foreign, 1);
        assert!(bus.transport().sent.is_empty(), "noise never answered");
    }

    #[test]
    fn adapter_counts_reply_frames_as_foreign() {
        let mut bus = adapter();
        bus.transport_mut()
            .feed(&encode_frame(Direction::Reply, "Sprinkler1 ack clear"));
        assert_eq!(bus.poll(), None);
        assert_eq!(bus.stats().foreign, 1);
        assert_eq!(bus.stats().dropped, 0);
    }

    #[test]
    fn adapter_bounds_bytes_per_cycle() {
        let mut bus = adapter();
        bus.transport_mut()
            .feed(&vec![b'x'; MAX_BYTES_PER_CYCLE + 50]);
        bus.transport_mut().feed(&request("Sprinkler1 clear"));

        assert_eq!(bus.poll(), None);
        assert_eq!(bus.transport().inbound.len(), 50 + request("Sprinkler1 clear").len());
        assert_eq!(bus.poll(), Some(Command::ClearAlarm));
    }

    #[test]
    fn adapter_respond_frames_reply() {
        let mut bus = adapter();
        bus.respond(&Response::Ack {
            verb: "clear",
            target: None,
        });
        let sent = bus.transport_mut().take_sent();
        assert_eq!(sent.len(), 1);
        let (dir, payload) = unwrap_frame(sent[0].strip_suffix(b"\n").unwrap()).unwrap();
        assert_eq!(dir, Direction::Reply);
        assert_eq!(payload, "Sprinkler1 ack clear");
    }

    struct BrokenLink;

    impl Transport for BrokenLink {
        fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
            Err(TransportError::Closed)
        }
        fn queue(&mut self, _frame: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::QueueFull)
        }
    }

    #[test]
    fn adapter_survives_transport_errors() {
        let mut bus = BusAdapter::new(ADDR, BrokenLink);
        assert_eq!(bus.poll(), None);
        bus.respond(&Response::Ack {
            verb: "clear",
            target: None,
        });
        assert_eq!(bus.stats().tx_failed, 1);
    }
}
