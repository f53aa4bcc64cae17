//! We use this mocking module in unit tests to emulate the serial line to a board.
//!
//! A [`MockSerial`] either replays scripted reply bytes, or is wired to a [`MockBoard`]
//! which decodes commands and answers them from a 64 KiB memory image.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::frame::{self, ACK, Command, CommandDecoder, NACK};
use crate::link::SerialChannel;

#[derive(Debug)]
pub enum MockSerialError {
    /// Nothing to read
    Timeout,
    /// Scripted data doesn't fit
    BufferOverflow,
    /// Generic simulated error for testing
    SimulatedError,
}

impl core::fmt::Display for MockSerialError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for MockSerialError {}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::Timeout => embedded_io::ErrorKind::TimedOut,
            MockSerialError::BufferOverflow => embedded_io::ErrorKind::OutOfMemory,
            MockSerialError::SimulatedError => embedded_io::ErrorKind::Other,
        }
    }
}

/// One command as seen by the board, with the bytes it answered.
#[derive(Debug, Clone, Default)]
pub struct WireExchange {
    pub command: Vec<u8>,
    pub reply: Vec<u8>,
}

#[derive(Debug, Default)]
struct WireLog {
    written: Vec<u8>,
    transcript: Vec<WireExchange>,
}

/// Shared record of everything the host put on the wire.
#[derive(Debug, Clone, Default)]
pub struct Wire(Arc<Mutex<WireLog>>);

impl Wire {
    pub fn written(&self) -> Vec<u8> {
        self.0.lock().written.clone()
    }

    pub fn clear(&self) {
        let mut log = self.0.lock();
        log.written.clear();
        log.transcript.clear();
    }

    /// Exchanges completed by a [`MockBoard`], in wire order.
    pub fn transcript(&self) -> Vec<WireExchange> {
        self.0.lock().transcript.clone()
    }
}

struct BoardState {
    memory: Vec<u8>,
    decoder: CommandDecoder,
    pending: Vec<u8>,
    outbox: VecDeque<u8>,
    rejected_writes: Vec<u16>,
    failing_reads: usize,
    silent: bool,
    gets: usize,
    sets: usize,
}

impl BoardState {
    fn answer(&mut self, command: Command) -> Vec<u8> {
        match command {
            Command::Get { address, length } => {
                self.gets += 1;
                if self.failing_reads > 0 {
                    self.failing_reads -= 1;
                    return vec![NACK];
                }
                let payload: Vec<u8> = (0..length as u16)
                    .map(|i| self.memory[address.wrapping_add(i) as usize])
                    .collect();
                frame::encode_reply(&payload)
            }
            Command::Set { address, payload } => {
                self.sets += 1;
                let end = address as u32 + payload.len() as u32;
                if self
                    .rejected_writes
                    .iter()
                    .any(|&a| (address as u32..end).contains(&(a as u32)))
                {
                    return vec![NACK];
                }
                for (i, &b) in payload.iter().enumerate() {
                    self.memory[address.wrapping_add(i as u16) as usize] = b;
                }
                vec![ACK]
            }
        }
    }
}

/// An emulated board answering GET and SET commands.
#[derive(Clone)]
pub struct MockBoard {
    state: Arc<Mutex<BoardState>>,
    wire: Wire,
}

impl MockBoard {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState {
                memory: vec![0; 0x1_0000],
                decoder: CommandDecoder::new(),
                pending: Vec::new(),
                outbox: VecDeque::new(),
                rejected_writes: Vec::new(),
                failing_reads: 0,
                silent: false,
                gets: 0,
                sets: 0,
            })),
            wire: Wire::default(),
        }
    }

    /// A serial port connected to this board.
    pub fn serial(&self) -> MockSerial {
        MockSerial {
            backend: Backend::Board(self.clone()),
            wire: self.wire.clone(),
            should_error_on_write: false,
            should_error_on_read: false,
        }
    }

    pub fn wire(&self) -> Wire {
        self.wire.clone()
    }

    pub fn load(&self, address: u16, data: &[u8]) {
        let mut state = self.state.lock();
        for (i, &b) in data.iter().enumerate() {
            state.memory[address.wrapping_add(i as u16) as usize] = b;
        }
    }

    /// Load a NUL padded string field.
    pub fn load_str(&self, address: u16, text: &str, size: usize) {
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(size, 0);
        self.load(address, &bytes);
    }

    pub fn memory(&self, address: u16, length: usize) -> Vec<u8> {
        let state = self.state.lock();
        (0..length)
            .map(|i| state.memory[address.wrapping_add(i as u16) as usize])
            .collect()
    }

    /// Answer NACK to any SET touching `address`.
    pub fn reject_writes_at(&self, address: u16) {
        self.state.lock().rejected_writes.push(address);
    }

    pub fn accept_all_writes(&self) {
        self.state.lock().rejected_writes.clear();
    }

    /// Answer NACK to the next `count` GET commands.
    pub fn fail_reads(&self, count: usize) {
        self.state.lock().failing_reads = count;
    }

    /// Stop answering anything.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Number of GET commands received.
    pub fn gets(&self) -> usize {
        self.state.lock().gets
    }

    /// Number of SET commands received.
    pub fn sets(&self) -> usize {
        self.state.lock().sets
    }

    fn receive(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        for &byte in bytes {
            state.pending.push(byte);
            // Malformed commands are dropped like line noise.
            let Ok(Some(command)) = state.decoder.push(byte) else {
                continue;
            };
            let reply = if state.silent {
                Vec::new()
            } else {
                state.answer(command)
            };
            state.outbox.extend(reply.iter().copied());
            let exchange = WireExchange {
                command: core::mem::take(&mut state.pending),
                reply,
            };
            self.wire.0.lock().transcript.push(exchange);
        }
    }

    fn transmit(&self, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        while count < buf.len() {
            let Some(b) = state.outbox.pop_front() else {
                break;
            };
            buf[count] = b;
            count += 1;
        }
        count
    }
}

enum Backend {
    Script {
        /// Bytes already waiting before the exchange starts
        stale: heapless::Vec<u8, 256>,
        /// Pre-configured response data to be read
        read_buffer: heapless::Vec<u8, 256>,
        read_position: usize,
    },
    Board(MockBoard),
}

/// Our mock type used to emulate a serial port.
pub struct MockSerial {
    backend: Backend,
    wire: Wire,
    should_error_on_write: bool,
    should_error_on_read: bool,
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }

        self.wire.0.lock().written.extend_from_slice(buf);
        if let Backend::Board(board) = &self.backend {
            board.receive(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_read {
            return Err(MockSerialError::SimulatedError);
        }

        match &mut self.backend {
            Backend::Script {
                stale,
                read_buffer,
                read_position,
            } => {
                if !stale.is_empty() {
                    let count = buf.len().min(stale.len());
                    buf[..count].copy_from_slice(&stale[..count]);
                    let rest: heapless::Vec<u8, 256> =
                        stale[count..].iter().copied().collect();
                    *stale = rest;
                    return Ok(count);
                }
                if *read_position >= read_buffer.len() {
                    return Err(MockSerialError::Timeout);
                }
                let count = buf.len().min(read_buffer.len() - *read_position);
                buf[..count].copy_from_slice(&read_buffer[*read_position..*read_position + count]);
                *read_position += count;
                Ok(count)
            }
            Backend::Board(board) => match board.transmit(buf) {
                0 => Err(MockSerialError::Timeout),
                n => Ok(n),
            },
        }
    }
}

impl SerialChannel for MockSerial {
    fn discard_input(&mut self) -> Result<(), Self::Error> {
        match &mut self.backend {
            Backend::Script { stale, .. } => stale.clear(),
            Backend::Board(board) => board.state.lock().outbox.clear(),
        }
        Ok(())
    }
}

impl MockSerial {
    /// A port replaying scripted replies.
    pub fn new() -> Self {
        Self {
            backend: Backend::Script {
                stale: heapless::Vec::new(),
                read_buffer: heapless::Vec::new(),
                read_position: 0,
            },
            wire: Wire::default(),
            should_error_on_write: false,
            should_error_on_read: false,
        }
    }

    /// Set the data that will be returned when read() is called
    pub fn set_read_data(&mut self, data: &[u8]) {
        if let Backend::Script {
            read_buffer,
            read_position,
            ..
        } = &mut self.backend
        {
            read_buffer.clear();
            *read_position = 0;
            // Scripts are short, anything past capacity is a test bug.
            assert!(
                read_buffer.extend_from_slice(data).is_ok(),
                "scripted reply too long"
            );
        }
    }

    /// Bytes sitting in the receive buffer before the next exchange.
    pub fn set_stale_data(&mut self, data: &[u8]) {
        if let Backend::Script { stale, .. } = &mut self.backend {
            stale.clear();
            assert!(stale.extend_from_slice(data).is_ok(), "stale data too long");
        }
    }

    pub fn wire(&self) -> Wire {
        self.wire.clone()
    }

    /// Configure whether write operations should fail with an error
    pub fn set_write_error(&mut self, should_error: bool) {
        self.should_error_on_write = should_error;
    }

    /// Configure whether read operations should fail with an error
    pub fn set_read_error(&mut self, should_error: bool) {
        self.should_error_on_read = should_error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error, Read, Write};

    #[test]
    fn test_write_is_logged() {
        let mut mock = MockSerial::new();
        let wire = mock.wire();
        mock.write(b"G\x00").unwrap();
        mock.write(b"\x10\x04").unwrap();
        assert_eq!(wire.written(), b"G\x00\x10\x04");
        wire.clear();
        assert!(wire.written().is_empty());
    }

    #[test]
    fn test_read_scripted_then_timeout() {
        let mut mock = MockSerial::new();
        mock.set_read_data(b"Hi");

        let mut buffer = [0u8; 10];
        assert_eq!(mock.read(&mut buffer).unwrap(), 2);
        assert_eq!(&buffer[..2], b"Hi");
        assert!(matches!(
            mock.read(&mut buffer).unwrap_err(),
            MockSerialError::Timeout
        ));
    }

    #[test]
    fn test_stale_data_is_discarded() {
        let mut mock = MockSerial::new();
        mock.set_stale_data(b"junk");
        mock.set_read_data(b"ok");
        mock.discard_input().unwrap();

        let mut buffer = [0u8; 4];
        assert_eq!(mock.read(&mut buffer).unwrap(), 2);
        assert_eq!(&buffer[..2], b"ok");
    }

    #[test]
    fn test_error_simulation() {
        let mut mock = MockSerial::new();
        mock.set_write_error(true);
        assert!(mock.write(b"test").is_err());
        assert!(mock.flush().is_err());
        assert!(mock.wire().written().is_empty());

        mock.set_read_data(b"data");
        mock.set_read_error(true);
        let mut buffer = [0u8; 4];
        assert!(matches!(
            mock.read(&mut buffer).unwrap_err(),
            MockSerialError::SimulatedError
        ));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(MockSerialError::Timeout.kind(), embedded_io::ErrorKind::TimedOut);
        assert_eq!(
            MockSerialError::BufferOverflow.kind(),
            embedded_io::ErrorKind::OutOfMemory
        );
        assert_eq!(MockSerialError::SimulatedError.kind(), embedded_io::ErrorKind::Other);
    }

    #[test]
    fn test_board_answers_get_and_set() {
        let board = MockBoard::new();
        board.load(0x1000, &[1, 2, 3, 4]);
        let mut serial = board.serial();

        serial.write(b"G\x00\x10\x04").unwrap();
        let mut buffer = [0u8; 8];
        assert_eq!(serial.read(&mut buffer).unwrap(), 5);
        assert_eq!(&buffer[..5], b"\x01\x02\x03\x04\x17");

        serial.write(b"S\x00\x20\x02\xAA\xBB").unwrap();
        assert_eq!(serial.read(&mut buffer).unwrap(), 1);
        assert_eq!(buffer[0], ACK);
        assert_eq!(board.memory(0x2000, 2), [0xAA, 0xBB]);
        assert_eq!((board.gets(), board.sets()), (1, 1));
    }

    #[test]
    fn test_board_rejections() {
        let board = MockBoard::new();
        board.reject_writes_at(0x2001);
        board.fail_reads(1);
        let mut serial = board.serial();
        let mut buffer = [0u8; 8];

        serial.write(b"S\x00\x20\x02\xAA\xBB").unwrap();
        serial.read(&mut buffer).unwrap();
        assert_eq!(buffer[0], NACK);
        assert_eq!(board.memory(0x2000, 2), [0, 0]);

        serial.write(b"G\x00\x10\x01").unwrap();
        serial.read(&mut buffer).unwrap();
        assert_eq!(buffer[0], NACK);

        // Only the first read fails.
        serial.write(b"G\x00\x10\x01").unwrap();
        assert_eq!(serial.read(&mut buffer).unwrap(), 2);
        assert_eq!(buffer[1], ACK);
    }

    #[test]
    fn test_silent_board_times_out() {
        let board = MockBoard::new();
        board.set_silent(true);
        let mut serial = board.serial();
        serial.write(b"G\x00\x10\x01").unwrap();
        let mut buffer = [0u8; 2];
        assert!(matches!(
            serial.read(&mut buffer).unwrap_err(),
            MockSerialError::Timeout
        ));
        assert_eq!(board.wire().transcript().len(), 1);
    }
}
