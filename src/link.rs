//! The serial link to a board: one request/response exchange at a time.
//!
//! A [`Connection`] owns the channel behind a mutex held for a whole exchange, so a
//! background sampler and foreground commands can share it without interleaving
//! their bytes on the wire.

use core::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use embedded_io::{Error as _, ErrorKind};
use fugit::MillisDurationU32;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, ProtocolError, Result};
use crate::frame::{self, Command, ReplyDecoder, Step};

/// Hardware writes must not cross this alignment.
pub const WRITE_ALIGNMENT: u16 = 16;

/// Timing and line settings of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    /// Default for the boards is 57600.
    pub baud_rate: u32,
    /// How long to wait for any single byte, in both directions.
    pub byte_timeout: MillisDurationU32,
    /// Ceiling for a whole reply.
    pub response_timeout: MillisDurationU32,
    /// Minimum delay after every transmitted byte, for hosts that don't honour stop bit timing.
    pub pacing: Option<MillisDurationU32>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            baud_rate: 57_600,
            byte_timeout: MillisDurationU32::millis(500),
            response_timeout: MillisDurationU32::millis(2_000),
            pacing: None,
        }
    }
}

fn to_std(duration: MillisDurationU32) -> Duration {
    Duration::from_millis(duration.to_millis() as u64)
}

/// A byte channel a [`Connection`] can drive.
///
/// A read returning `Ok(0)` or failing with [`ErrorKind::TimedOut`] means nothing arrived in time.
pub trait SerialChannel: embedded_io::Read + embedded_io::Write + Send {
    /// Drop any stale bytes waiting in the receive buffer.
    fn discard_input(&mut self) -> core::result::Result<(), Self::Error> {
        Ok(())
    }
}

/// [`SerialChannel`] over an OS serial port.
pub struct SerialPortChannel(Box<dyn serialport::SerialPort>);

impl SerialPortChannel {
    pub fn name(&self) -> Option<String> {
        self.0.name()
    }
}

#[derive(Debug)]
pub struct SerialIoError(std::io::Error);

impl core::fmt::Display for SerialIoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SerialIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for SerialIoError {
    fn kind(&self) -> ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
            std::io::ErrorKind::InvalidInput => ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => ErrorKind::Unsupported,
            _ => ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for SerialPortChannel {
    type Error = SerialIoError;
}

impl embedded_io::Read for SerialPortChannel {
    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(SerialIoError)
    }
}

impl embedded_io::Write for SerialPortChannel {
    fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(SerialIoError)
    }

    fn flush(&mut self) -> core::result::Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(SerialIoError)
    }
}

impl SerialChannel for SerialPortChannel {
    fn discard_input(&mut self) -> core::result::Result<(), Self::Error> {
        self.0
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| SerialIoError(e.into()))
    }
}

/// Process unique identity of a connection, used to key cached parameter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read/write access to a board's memory space.
///
/// Parameters only ever talk to a board through this trait.
pub trait Transport: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Read `length` bytes starting at `address`.
    fn read(&self, address: u16, length: u8) -> Result<Vec<u8>>;

    /// Write `data` at `address` in a single SET. `Ok(false)` when the board answers NACK.
    fn write(&self, address: u16, data: &[u8]) -> Result<bool>;

    /// Write `data` in SETs that never cross a [`WRITE_ALIGNMENT`] boundary.
    ///
    /// Stops at, and reports, the first rejected chunk.
    fn write_aligned(&self, address: u16, data: &[u8]) -> Result<bool> {
        for (chunk_address, chunk) in aligned_chunks(address, data) {
            if !self.write(chunk_address, chunk)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Split `data` written at `address` into pieces that stay inside one aligned block.
pub fn aligned_chunks(address: u16, data: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    let mut address = address;
    let mut rest = data;
    core::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let room = (WRITE_ALIGNMENT - (address % WRITE_ALIGNMENT)) as usize;
        let (chunk, tail) = rest.split_at(room.min(rest.len()));
        let item = (address, chunk);
        address = address.wrapping_add(chunk.len() as u16);
        rest = tail;
        Some(item)
    })
}

/// An open link to one board.
pub struct Connection<S: SerialChannel> {
    id: ConnectionId,
    label: String,
    options: LinkOptions,
    /// `None` once closed.
    channel: Mutex<Option<S>>,
    exchanges: AtomicU64,
    span: tracing::Span,
}

impl Connection<SerialPortChannel> {
    /// Claim the serial port `port` (8N1, no flow control).
    pub fn open(port: &str, options: &LinkOptions) -> Result<Self> {
        debug!("Opening serial port {port} at {} baud", options.baud_rate);
        let serial = serialport::new(port, options.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(to_std(options.byte_timeout))
            .open()
            .map_err(|e| {
                ProtocolError::caused_by(
                    format!("serial port {port} does not exist or is not available"),
                    ProtocolError::new(e.to_string()),
                )
            })?;

        let connection = Self::new(SerialPortChannel(serial), port, *options);
        debug!("Port {port} is ready");
        Ok(connection)
    }
}

impl<S: SerialChannel> Connection<S> {
    pub fn new(channel: S, label: impl Into<String>, options: LinkOptions) -> Self {
        let label = label.into();
        let id = ConnectionId::next();
        let span = tracing::debug_span!("link", port = %label, id = %id);
        Self {
            id,
            label,
            options,
            channel: Mutex::new(Some(channel)),
            exchanges: AtomicU64::new(0),
            span,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn options(&self) -> &LinkOptions {
        &self.options
    }

    /// Number of exchanges started on this link.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.channel.lock().is_some()
    }

    /// Release the channel. Later exchanges fail with a protocol error.
    pub fn close(&self) {
        let _enter = self.span.enter();
        if self.channel.lock().take().is_some() {
            debug!("Closed link {}", self.label);
        }
    }

    /// Run `exchange` with exclusive access to the channel.
    fn with_channel<T>(
        &self,
        exchange: impl FnOnce(&mut S) -> core::result::Result<T, ProtocolError>,
    ) -> core::result::Result<T, ProtocolError> {
        let mut guard = self.channel.lock();
        let channel = guard
            .as_mut()
            .ok_or_else(|| ProtocolError::new(format!("link {} is closed", self.label)))?;
        self.exchanges.fetch_add(1, Ordering::Relaxed);

        channel
            .discard_input()
            .map_err(|e| ProtocolError::io("could not flush the receive buffer", e))?;
        exchange(channel)
    }

    fn transmit(&self, channel: &mut S, bytes: &[u8]) -> core::result::Result<(), ProtocolError> {
        for &byte in bytes {
            trace!("Transmitting: 0x{byte:02X}");
            channel.write_all(&[byte]).map_err(|e| {
                if e.kind() == ErrorKind::TimedOut {
                    ProtocolError::new("transmission failed (timeout)")
                } else {
                    ProtocolError::io("transmission failed", e)
                }
            })?;
            if let Some(pacing) = self.options.pacing {
                std::thread::sleep(to_std(pacing));
            }
        }
        channel
            .flush()
            .map_err(|e| ProtocolError::io("transmission failed", e))
    }

    fn receive(&self, channel: &mut S, deadline: Instant) -> core::result::Result<u8, ProtocolError> {
        let mut buf = [0u8; 1];
        loop {
            if Instant::now() > deadline {
                return Err(ProtocolError::new("the device took too long to answer (timeout)"));
            }
            match channel.read(&mut buf) {
                Ok(0) => return Err(ProtocolError::new("the device is not responding (timeout)")),
                Ok(_) => {
                    trace!("Received: 0x{:02X}", buf[0]);
                    return Ok(buf[0]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(ProtocolError::new("the device is not responding (timeout)"));
                }
                Err(e) => return Err(ProtocolError::io("reception failed", e)),
            }
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + to_std(self.options.response_timeout)
    }
}

impl<S: SerialChannel> Transport for Connection<S> {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn read(&self, address: u16, length: u8) -> Result<Vec<u8>> {
        let _enter = self.span.enter();
        debug!("Reading {length} bytes from 0x{address:04X}");
        let command = Command::Get { address, length }.encode()?;

        let result = self.with_channel(|channel| {
            self.transmit(channel, &command)?;

            let deadline = self.deadline();
            let mut decoder = ReplyDecoder::new(length as usize);
            loop {
                let byte = self.receive(channel, deadline).map_err(|e| {
                    ProtocolError::caused_by(
                        format!(
                            "reception failed after {} of {length} bytes",
                            decoder.received()
                        ),
                        e,
                    )
                })?;
                if let Step::Complete(payload) = decoder
                    .push(byte)
                    .map_err(|e| ProtocolError::caused_by("reception failed", e))?
                {
                    return Ok(payload);
                }
            }
        });

        result.map_err(|e| {
            let e = ProtocolError::caused_by(
                format!("could not read 0x{address:04X} / {length} bytes"),
                e,
            );
            warn!("{}", e.chain());
            Error::Protocol(e)
        })
    }

    fn write(&self, address: u16, data: &[u8]) -> Result<bool> {
        let _enter = self.span.enter();
        debug!("Writing {} bytes at 0x{address:04X}", data.len());
        let command = Command::Set {
            address,
            payload: data.to_vec(),
        }
        .encode()?;

        let result = self.with_channel(|channel| {
            self.transmit(channel, &command)?;
            let answer = self.receive(channel, self.deadline()).map_err(|e| {
                ProtocolError::caused_by("the device did not send the accept/reject answer", e)
            })?;
            frame::decode_answer(answer)
        });

        match result {
            Ok(accepted) => {
                if accepted {
                    debug!("Write accepted (ACK)");
                } else {
                    debug!("Write rejected (NACK)");
                }
                Ok(accepted)
            }
            Err(e) => {
                let e = ProtocolError::caused_by(
                    format!("could not write 0x{address:04X} / {} bytes", data.len()),
                    e,
                );
                warn!("{}", e.chain());
                Err(Error::Protocol(e))
            }
        }
    }
}

impl<S: SerialChannel> Drop for Connection<S> {
    fn drop(&mut self) {
        self.close();
    }
}
