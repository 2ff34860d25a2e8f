//! # s1flash
//!
//! A Rust library for flashing Sony Xperia phones through the "S1 boot"
//! USB interface.
//!
//! The S1 loader speaks a fastboot-like text protocol over a pair of USB
//! bulk endpoints. On top of it this library implements everything a stock
//! firmware flash needs:
//!
//! - Device discovery and stream re-synchronisation after aborted sessions
//! - The framed command protocol (`OKAY`/`FAIL`/`DATA` responses) and the
//!   two-phase `download:`/`signature:` upload handshake
//! - The Trim Area (TA) store: a catalogue of known units, read/write
//!   access, and the textual `.ta` container format
//! - Delivery manifests (`partition_delivery.xml`, `boot_delivery.xml`,
//!   `update.xml`) and boot-configuration selection by platform identity
//! - SIN archive dispatch (CMS signature first, then image chunks, with
//!   slot-aware erase/flash sequencing)
//! - The full stock-flash orchestration, including repartitioning,
//!   two-slot images, protected TA units and flash-mode lifecycle
//!
//! ## Usage Example
//!
//! ```no_run
//! use s1flash::{FlashOptions, Flasher};
//! use std::path::PathBuf;
//!
//! let opts = FlashOptions { test: 0, ..FlashOptions::default() };
//! let mut flasher = Flasher::from_directory(
//!     PathBuf::from("/path/to/firmware"),
//!     opts,
//!     None,
//! ).unwrap();
//!
//! flasher.flash().unwrap();
//! ```
//!
//! ## Device Connection
//!
//! The phone must be connected in S1 boot (flash) mode, usually by holding
//! the volume-down key while plugging in the USB cable. The device
//! enumerates as `0FCE:B00B`.

mod setup;
mod transport;

/// Delivery manifest parsing and boot-configuration selection
pub mod delivery;
/// The S1 wire protocol engine
pub mod protocol;
/// SIN archive inspection and dispatch
pub mod sin;
/// The Trim Area unit catalogue
pub mod ta;
/// The textual TA container codec
pub mod tafile;

mod flash;

use std::sync::Arc;

pub use flash::{DeviceVars, FlashOptions, FlashPhase, Flasher};
pub use protocol::{Engine, Value, ValueKind};
pub use transport::{Transport, UsbTransport};

/// Callback type for receiving flash events
///
/// This is used to observe the flashing process, such as phase
/// transitions and per-file progress.
pub type Callback = Arc<dyn Fn(Event) + Send + Sync>;

/// Events emitted during the flashing process
#[derive(Debug)]
pub enum Event {
  /// Indicates the tool is searching for a connected device
  FindingDevice,
  /// Indicates the tool is attempting to connect to the device
  Connecting,
  /// Indicates a successful connection to the device
  Connected,
  /// Indicates movement to a new flashing phase
  Phase(FlashPhase),
  /// A SIN archive is being dispatched to the device
  SinFile(String),
  /// A TA file is being applied to the device
  TaFile(String),
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while talking to the device
#[derive(thiserror::Error, Debug)]
pub enum Error {
  /// Error from the USB subsystem
  #[error("USB error: {0}")]
  Usb(#[from] rusb::Error),

  /// I/O related error
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// A bulk transfer made no progress within its deadline
  #[error("bulk transfer timed out")]
  Timeout,

  /// Transport failure independent of any device reply
  #[error("transport error: {0}")]
  Transport(String),

  /// Malformed or unexpected response framing
  #[error("protocol error: {0}")]
  Protocol(String),

  /// The device answered a command with `FAIL`
  #[error("device answered FAIL: {0}")]
  DeviceFail(String),

  /// Malformed TA, XML or SIN input
  #[error("cannot parse {path}: {message}")]
  Parse { path: String, message: String },

  /// Operation attempted in the wrong session state
  #[error("invalid state: {0}")]
  State(String),

  /// The device does not support the requested command form
  #[error("not supported by device: {0}")]
  Unsupported(String),
}

impl Error {
  pub(crate) fn parse(path: impl Into<String>, message: impl Into<String>) -> Self {
    Error::Parse {
      path: path.into(),
      message: message.into(),
    }
  }

  pub(crate) fn proto(message: impl Into<String>) -> Self {
    Error::Protocol(message.into())
  }
}

const VENDOR_ID: u16 = 0x0fce;
const PRODUCT_ID: u16 = 0xb00b;

// somc loaders answer getvar within this window once the stream is clean
const DEFAULT_READ_TIMEOUT_MS: u64 = 500;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 2000;

const DRAIN_CHUNK_SIZE: usize = 0x1000;
const DRAIN_SLICE_MS: u64 = 10;

// resync pads with max-packet-size minus this gap, see Engine::resync
const RESYNC_PAD_GAP: usize = 16;
const RESYNC_MAX_ROUNDS: usize = 1024;

/// Partition-2 TA units that are never written from a TA file during
/// flashing. They hold hardware keys and device identity; overwriting
/// them bricks the phone.
pub const PROTECTED_TA_UNITS: &[u32] = &[2003, 2010, 2129, 2210, 4900, 66667];

// images flashed to both slots on dual-slot devices
const BOTH_SLOT_IMAGES: &[&str] = &["bootloader", "bluetooth", "dsp", "modem", "rdimage"];

#[cfg(test)]
pub(crate) mod testing {
  use crate::{Error, Result, Transport};
  use std::collections::VecDeque;
  use std::time::Duration;

  /// Scripted in-memory transport: each queued item is the outcome of one
  /// `read_upto` call, `None` meaning a timeout.
  pub struct MockTransport {
    pub reads: VecDeque<Option<Vec<u8>>>,
    pub writes: Vec<Vec<u8>>,
    pub max_packet: usize,
  }

  impl MockTransport {
    pub fn new(reads: Vec<Option<Vec<u8>>>) -> Self {
      MockTransport {
        reads: reads.into(),
        writes: vec![],
        max_packet: 512,
      }
    }

    pub fn written_strings(&self) -> Vec<String> {
      self
        .writes
        .iter()
        .map(|w| w.iter().map(|&b| b as char).collect())
        .collect()
    }
  }

  impl Transport for MockTransport {
    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
      self.writes.push(data.to_vec());
      Ok(())
    }

    fn read_upto(&mut self, max: usize, _timeout: Duration) -> Result<Vec<u8>> {
      match self.reads.pop_front() {
        Some(Some(mut data)) => {
          data.truncate(max);
          Ok(data)
        }
        Some(None) | None => Err(Error::Timeout),
      }
    }

    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
      let mut data = vec![];
      while data.len() < n {
        let chunk = self.read_upto(n - data.len(), timeout)?;
        if chunk.is_empty() {
          return Err(Error::Timeout);
        }
        data.extend_from_slice(&chunk);
      }
      Ok(data)
    }

    fn max_packet_size(&self) -> usize {
      self.max_packet
    }
  }
}
