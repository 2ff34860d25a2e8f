#[cfg(target_os = "linux")]
use crate::{Result, PRODUCT_ID, VENDOR_ID};

/// Install a udev rule granting the current user access to the S1 boot
/// device, via polkit. Falls back to printing manual instructions.
#[cfg(target_os = "linux")]
pub fn setup_host_linux() -> Result<()> {
  use std::process::Command;

  let username = whoami::username()?;
  let rule = format!(
    "SUBSYSTEM==\"usb\", ATTRS{{idVendor}}==\"{:04x}\", ATTRS{{idProduct}}==\"{:04x}\", OWNER=\"{}\", MODE=\"0666\"\n",
    VENDOR_ID, PRODUCT_ID, username
  );

  let staged = std::env::temp_dir().join("98-s1boot.rules");
  std::fs::write(&staged, rule)?;
  tracing::debug!("staged udev rule at {}", staged.display());

  let run_root = |args: &[&str]| -> bool {
    Command::new("pkexec")
      .args(args)
      .status()
      .map(|status| status.success())
      .unwrap_or(false)
  };

  let installed = run_root(&["cp", &staged.to_string_lossy(), "/etc/udev/rules.d/98-s1boot.rules"]);
  if installed {
    if run_root(&["udevadm", "control", "--reload-rules"]) && run_root(&["udevadm", "trigger"]) {
      tracing::info!("udev rule installed and activated, the device should now be accessible");
      let _ = std::fs::remove_file(&staged);
      return Ok(());
    }
    tracing::warn!("udev rule installed but not reloaded");
  } else {
    tracing::warn!("could not install the udev rule via polkit");
  }

  tracing::info!("to finish the setup manually, run:");
  tracing::info!("  sudo cp {} /etc/udev/rules.d/", staged.display());
  tracing::info!("  sudo udevadm control --reload-rules && sudo udevadm trigger");
  Ok(())
}
