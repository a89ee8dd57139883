//! Compact binary packet codec.
//!
//! Every datagram starts with a 5 byte header:
//!
//! | offset | size | field                        |
//! |--------|------|------------------------------|
//! | 0      | 1    | protocol version             |
//! | 1      | 2    | ASCII command code           |
//! | 3      | 2    | transaction id (big-endian)  |
//! | 5      | ..   | payload                      |
//!
//! Strings are length-prefixed (`u8`), integers big-endian, coordinates are
//! micro-degrees and temperature/humidity are tenths.

use std::fmt;

use crate::error::{DeviceError, Result};
use crate::types::{ConfigUpdate, Reading};

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 5;
/// Most readings one telemetry packet may carry; keeps the datagram under
/// a typical 1500 byte MTU.
pub const MAX_READINGS_PER_PACKET: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandCode(pub [u8; 2]);

impl CommandCode {
    pub const POWER_ON: Self = Self(*b"P+");
    pub const CONFIG: Self = Self(*b"C+");
    pub const CONFIG_WRITE: Self = Self(*b"C=");
    pub const TELEMETRY: Self = Self(*b"T+");
    pub const MOTION_START: Self = Self(*b"M+");
    pub const MOTION_STOP: Self = Self(*b"M-");
    pub const UPDATE_REQUEST: Self = Self(*b"U+");
    pub const UPDATE_STATUS: Self = Self(*b"U-");

    pub fn is_ack(&self) -> bool {
        self.0[0] == b'A'
    }

    pub fn is_config_write(&self) -> bool {
        *self == Self::CONFIG_WRITE || self.0[0] == b'W'
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            let c = if b.is_ascii_graphic() { char::from(b) } else { '?' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub command: CommandCode,
    pub transaction_id: u16,
}

pub fn decode_header(datagram: &[u8]) -> Result<(Header, &[u8])> {
    if datagram.len() < HEADER_LEN {
        return Err(DeviceError::MalformedPacket {
            needed: HEADER_LEN,
            got: datagram.len(),
        });
    }
    let header = Header {
        version: datagram[0],
        command: CommandCode([datagram[1], datagram[2]]),
        transaction_id: u16::from_be_bytes([datagram[3], datagram[4]]),
    };
    Ok((header, &datagram[HEADER_LEN..]))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    Gnss {
        lat: f64,
        lon: f64,
    },
    Cell {
        mcc: String,
        mnc: String,
        lac: String,
        cell: String,
        signal: u8,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorData {
    Null,
    Steps {
        battery: u8,
        rssi: u8,
        steps: u32,
    },
    Multi {
        battery: u8,
        rssi: u8,
        first_timestamp: u32,
        interval: u32,
        records: Vec<Reading>,
    },
    Identity(PowerOn),
    Config(ConfigReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerOn {
    pub imei: String,
    pub customer_code: String,
    pub software_version: String,
    pub modem_version: String,
    pub mcc: String,
    pub mnc: String,
    pub rat: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigReport {
    pub server_address: String,
    pub reporting_interval: u32,
    pub reading_interval: u32,
}

/// Timestamped location plus sensor block, shared by telemetry and motion packets.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub timestamp: u32,
    pub location: Option<Location>,
    pub sensor: SensorData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Started,
    Success,
    Failed,
}

impl UpdateState {
    fn code(self) -> u8 {
        match self {
            UpdateState::Started => 0,
            UpdateState::Success => 1,
            UpdateState::Failed => 2,
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateState::Started => "started",
            UpdateState::Success => "success",
            UpdateState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatus {
    pub component: String,
    pub state: UpdateState,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub component: String,
    pub url: String,
    pub arguments: String,
}

impl UpdateRequest {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(UpdateRequest {
            component: r.string()?,
            url: r.string()?,
            arguments: r.string()?,
        })
    }
}

impl ConfigUpdate {
    /// Decodes a config write payload: each field is preceded by a presence byte.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let server_address = if r.u8()? != 0 { Some(r.string()?) } else { None };
        let reporting_interval_secs = if r.u8()? != 0 { Some(u64::from(r.u32()?)) } else { None };
        let reading_interval_secs = if r.u8()? != 0 { Some(u64::from(r.u32()?)) } else { None };
        Ok(ConfigUpdate {
            server_address,
            reporting_interval_secs,
            reading_interval_secs,
        })
    }
}

/// Packets the device sends.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    PowerOn(PowerOn),
    Config(ConfigReport),
    Telemetry(Report),
    MotionStart(Report),
    MotionStop(Report),
    UpdateStatus(UpdateStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub transaction_id: u16,
    pub body: Body,
}

impl Packet {
    pub fn new(transaction_id: u16, body: Body) -> Self {
        Self {
            transaction_id,
            body,
        }
    }

    pub fn command(&self) -> CommandCode {
        match &self.body {
            Body::PowerOn(_) => CommandCode::POWER_ON,
            Body::Config(_) => CommandCode::CONFIG,
            Body::Telemetry(_) => CommandCode::TELEMETRY,
            Body::MotionStart(_) => CommandCode::MOTION_START,
            Body::MotionStop(_) => CommandCode::MOTION_STOP,
            Body::UpdateStatus(_) => CommandCode::UPDATE_STATUS,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        w.header(self.command(), self.transaction_id);
        match &self.body {
            Body::PowerOn(p) => encode_power_on(&mut w, p)?,
            Body::Config(c) => encode_config(&mut w, c)?,
            Body::Telemetry(r) | Body::MotionStart(r) | Body::MotionStop(r) => {
                encode_report(&mut w, r)?
            }
            Body::UpdateStatus(s) => {
                w.string(&s.component)?;
                w.u8(s.state.code());
                w.string(&s.reason)?;
            }
        }
        Ok(w.buf)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} txn={}]", self.command(), self.transaction_id)?;
        match &self.body {
            Body::PowerOn(p) => write!(
                f,
                " imei={} code={} sw={} modem={} mcc={} mnc={} rat={}",
                p.imei, p.customer_code, p.software_version, p.modem_version, p.mcc, p.mnc, p.rat
            ),
            Body::Config(c) => write!(
                f,
                " server={} interval={}s readings={}s",
                c.server_address, c.reporting_interval, c.reading_interval
            ),
            Body::Telemetry(r) | Body::MotionStart(r) | Body::MotionStop(r) => {
                write!(f, " ts={}", r.timestamp)?;
                if let Some(location) = &r.location {
                    write!(f, " {}", location)?;
                }
                write!(f, " {}", r.sensor)
            }
            Body::UpdateStatus(s) => {
                write!(f, " component={} status={}", s.component, s.state)?;
                if !s.reason.is_empty() {
                    write!(f, " reason={}", s.reason)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Gnss { lat, lon } => write!(f, "gnss({:.6}, {:.6})", lat, lon),
            Location::Cell {
                mcc,
                mnc,
                lac,
                cell,
                signal,
            } => write!(f, "cell(mcc={} mnc={} lac={} cell={} signal={})", mcc, mnc, lac, cell, signal),
        }
    }
}

impl fmt::Display for SensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorData::Null => f.write_str("sensor(null)"),
            SensorData::Steps {
                battery,
                rssi,
                steps,
            } => write!(f, "steps={} battery={}% rssi={}", steps, battery, rssi),
            SensorData::Multi {
                battery,
                rssi,
                first_timestamp,
                interval,
                records,
            } => {
                write!(
                    f,
                    "battery={}% rssi={} first_ts={} every {}s readings=[",
                    battery, rssi, first_timestamp, interval
                )?;
                for (i, r) in records.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{:.1}C/{:.1}%", r.temperature, r.humidity)?;
                }
                f.write_str("]")
            }
            SensorData::Identity(p) => write!(f, "identity(imei={} code={})", p.imei, p.customer_code),
            SensorData::Config(c) => write!(
                f,
                "config(server={} interval={}s readings={}s)",
                c.server_address, c.reporting_interval, c.reading_interval
            ),
        }
    }
}

pub(crate) fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn encode_power_on(w: &mut Writer, p: &PowerOn) -> Result<()> {
    for s in [
        &p.imei,
        &p.customer_code,
        &p.software_version,
        &p.modem_version,
        &p.mcc,
        &p.mnc,
        &p.rat,
    ] {
        w.string(s)?;
    }
    Ok(())
}

fn encode_config(w: &mut Writer, c: &ConfigReport) -> Result<()> {
    w.string(&c.server_address)?;
    w.u32(c.reporting_interval);
    w.u32(c.reading_interval);
    Ok(())
}

fn encode_report(w: &mut Writer, report: &Report) -> Result<()> {
    w.u32(report.timestamp);
    match &report.location {
        None => w.u8(b'0'),
        Some(Location::Gnss { lat, lon }) => {
            w.u8(b'G');
            w.i32(to_micro_degrees(*lat));
            w.i32(to_micro_degrees(*lon));
        }
        Some(Location::Cell {
            mcc,
            mnc,
            lac,
            cell,
            signal,
        }) => {
            w.u8(b'L');
            w.string(mcc)?;
            w.string(mnc)?;
            w.string(lac)?;
            w.string(cell)?;
            w.u8(*signal);
        }
    }
    match &report.sensor {
        SensorData::Null => w.u8(b'N'),
        SensorData::Steps {
            battery,
            rssi,
            steps,
        } => {
            w.u8(b'S');
            w.u8(*battery);
            w.u8(*rssi);
            w.u32(*steps);
        }
        SensorData::Multi {
            battery,
            rssi,
            first_timestamp,
            interval,
            records,
        } => {
            let count = u16::try_from(records.len())
                .ok()
                .filter(|n| usize::from(*n) <= MAX_READINGS_PER_PACKET)
                .ok_or_else(|| {
                    DeviceError::Encode(format!("too many readings for one packet: {}", records.len()))
                })?;
            w.u8(b'R');
            w.u8(*battery);
            w.u8(*rssi);
            w.u32(*first_timestamp);
            w.u32(*interval);
            w.u16(count);
            for record in records {
                w.i16((record.temperature * 10.0).round() as i16);
                w.u16((record.humidity * 10.0).round() as u16);
            }
        }
        SensorData::Identity(p) => {
            w.u8(b'I');
            encode_power_on(w, p)?;
        }
        SensorData::Config(c) => {
            w.u8(b'K');
            encode_config(w, c)?;
        }
    }
    Ok(())
}

fn to_micro_degrees(deg: f64) -> i32 {
    (deg * 1_000_000.0).round() as i32
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn header(&mut self, command: CommandCode, transaction_id: u16) {
        self.u8(PROTOCOL_VERSION);
        self.buf.extend_from_slice(&command.0);
        self.u16(transaction_id);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn string(&mut self, s: &str) -> Result<()> {
        let len = u8::try_from(s.len())
            .map_err(|_| DeviceError::Encode(format!("string too long ({} bytes)", s.len())))?;
        self.buf.push(len);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(DeviceError::Decode(format!(
                "payload truncated: needed {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    fn string(&mut self) -> Result<String> {
        let len = usize::from(self.u8()?);
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| DeviceError::Decode(e.to_string()))
    }
}
