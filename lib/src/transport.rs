use rusb::{Context, DeviceHandle, Direction, UsbContext};
use std::time::Duration;

use crate::{Error, Result, DRAIN_CHUNK_SIZE, DRAIN_SLICE_MS, PRODUCT_ID, VENDOR_ID};

/// A full-duplex bulk pipe to the S1 loader.
///
/// The protocol engine only ever sees this trait, so tests can run the
/// whole command layer against a scripted in-memory transport.
pub trait Transport {
  /// Send the full buffer, looping over as many bulk packets as needed.
  fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

  /// Read at most one packet-sized chunk, up to `max` bytes.
  /// A timeout is reported as [`Error::Timeout`].
  fn read_upto(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>>;

  /// Accumulate packets until exactly `n` bytes have been read.
  fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>>;

  fn max_packet_size(&self) -> usize;

  /// Best-effort flush of the IN endpoint, ignoring timeouts. Used when
  /// re-synchronising a half-open stream.
  fn drain(&mut self, window: Duration) {
    let slices = window.as_millis() as u64 / DRAIN_SLICE_MS;
    for _ in 0..slices.max(1) {
      match self.read_upto(DRAIN_CHUNK_SIZE, Duration::from_millis(DRAIN_SLICE_MS)) {
        Ok(_) => continue,
        Err(_) => break,
      }
    }
  }
}

/// The rusb-backed transport used for real devices.
pub struct UsbTransport {
  handle: DeviceHandle<Context>,
  interface_number: u8,
  endpoint_in: u8,
  endpoint_out: u8,
  max_packet_size: usize,
}

impl UsbTransport {
  /// Find the single S1 boot device on the bus and claim its bulk
  /// interface. Exactly one `0FCE:B00B` device must be present.
  pub fn open() -> Result<Self> {
    let context = Context::new()?;
    let devices = context.devices()?;
    let mut found = devices.iter().filter(|device| {
      if let Ok(desc) = device.device_descriptor() {
        desc.vendor_id() == VENDOR_ID && desc.product_id() == PRODUCT_ID
      } else {
        false
      }
    });

    let device = found.next().ok_or_else(|| {
      Error::Transport(format!("S1 USB device {:04X}:{:04X} not found", VENDOR_ID, PRODUCT_ID))
    })?;
    if found.next().is_some() {
      return Err(Error::Transport(format!(
        "more than one {:04X}:{:04X} device connected",
        VENDOR_ID, PRODUCT_ID
      )));
    }

    let mut handle = device.open()?;
    handle.reset()?;

    let config = device.config_descriptor(0)?;
    handle.set_active_configuration(config.number())?;

    let interface_number: u8 = 0;
    handle.claim_interface(interface_number)?;

    let interface = config
      .interfaces()
      .find(|i| i.number() == interface_number)
      .ok_or_else(|| Error::Transport("interface 0 not found".into()))?;
    let descriptor = interface
      .descriptors()
      .next()
      .ok_or_else(|| Error::Transport("no alt setting on interface 0".into()))?;

    let mut endpoint_in = None;
    let mut endpoint_out = None;
    let mut max_packet_size = 0usize;
    for ep in descriptor.endpoint_descriptors() {
      match ep.direction() {
        Direction::In => {
          if endpoint_in.is_none() {
            endpoint_in = Some(ep.address());
          }
        }
        Direction::Out => {
          if endpoint_out.is_none() {
            endpoint_out = Some(ep.address());
            max_packet_size = ep.max_packet_size() as usize;
          }
        }
      }
    }
    let endpoint_in = endpoint_in.ok_or_else(|| Error::Transport("IN endpoint not found".into()))?;
    let endpoint_out = endpoint_out.ok_or_else(|| Error::Transport("OUT endpoint not found".into()))?;

    tracing::info!(
      "device connected, interface {} claimed (in: 0x{:02X}, out: 0x{:02X}, packet: {})",
      interface_number,
      endpoint_in,
      endpoint_out,
      max_packet_size
    );

    Ok(Self {
      handle,
      interface_number,
      endpoint_in,
      endpoint_out,
      max_packet_size,
    })
  }

  /// Set up the host environment for USB access (installs udev rules on
  /// Linux, no-op elsewhere).
  pub fn host_setup() -> Result<()> {
    #[cfg(target_os = "linux")]
    crate::setup::setup_host_linux()?;

    Ok(())
  }
}

fn map_usb(err: rusb::Error) -> Error {
  match err {
    rusb::Error::Timeout => Error::Timeout,
    other => Error::Usb(other),
  }
}

impl Transport for UsbTransport {
  fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
      let n = self
        .handle
        .write_bulk(self.endpoint_out, &data[written..], timeout)
        .map_err(map_usb)?;
      if n == 0 {
        return Err(Error::Transport(format!(
          "bulk write stalled at {} of {} bytes",
          written,
          data.len()
        )));
      }
      written += n;
    }
    Ok(())
  }

  fn read_upto(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; max];
    let n = self
      .handle
      .read_bulk(self.endpoint_in, &mut buf, timeout)
      .map_err(map_usb)?;
    buf.truncate(n);
    Ok(buf)
  }

  fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(n);
    while data.len() < n {
      let want = (n - data.len()).min(self.max_packet_size.max(64));
      let chunk = self.read_upto(want, timeout)?;
      if chunk.is_empty() {
        return Err(Error::Transport(format!(
          "short read: got {} of {} bytes",
          data.len(),
          n
        )));
      }
      data.extend_from_slice(&chunk);
    }
    Ok(data)
  }

  fn max_packet_size(&self) -> usize {
    self.max_packet_size
  }
}

impl Drop for UsbTransport {
  fn drop(&mut self) {
    match self.handle.release_interface(self.interface_number) {
      Ok(()) => tracing::trace!("released usb interface"),
      Err(err) => tracing::warn!("failed to release usb interface: {:?}", err),
    }
  }
}
