//! This crate provides an interface for communicating with and configuring EstCard voltage
//! stabilizer control boards over a serial line.
//!
//! The boards speak a small byte stuffed memory protocol:
//! * `G lo hi len` reads `len` bytes starting at a 16 bit address, answered by the data then ACK
//! * `S lo hi len data..` writes `len` bytes, answered by a single ACK or NACK
//! * `0x1B` escapes ESC, EXIT, GET and SET inside a command body, and ESC, ACK and NACK
//!   inside a reply payload; the escaped byte goes out XORed with `0x4E`
//!
//! On top of that sit typed parameters (a format string at an address), scaled parameters
//! (raw integers shown in engineering units), a per-firmware parameter table, and a background
//! sampler for the live measure record.
//!
//! Kernels recognised:
//! * CtrEst 1V0
//! * CtrEst 1V05_T (test build of 1V0)
//! * CtrEst 1V2
//!
//! The serial port should be configured like so:
//! * Default baud rate: 57600
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None
//! * No flow control
//!
//! ```no_run
//! use est_link::board::{Card, PhaseLabel, names};
//! use est_link::config::load_config;
//!
//! let config = load_config(None)?;
//! let card = Card::open(&config)?;
//! println!("{}", card.identity());
//! println!("scale = {}", card.scale()?);
//! println!("gain LN = {}", card.phase(PhaseLabel::Ln).gain()?);
//! println!("client = {}", card.get(names::CLIENT)?);
//! card.close()?;
//! # Ok::<(), est_link::error::Error>(())
//! ```

pub mod board;
pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod link;
pub mod mode;
pub mod param;
pub mod sampling;
pub mod scaled;
pub mod template;

#[cfg(test)]
mod mock_serial;

pub use board::{BoardModel, Card, Identity};
pub use error::{Error, ProtocolError, Result};
pub use link::{Connection, LinkOptions, SerialChannel, Transport};
pub use param::{ParamValue, ParameterDescriptor, ParameterOwner};
