use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::delivery::{self, BootDelivery, UpdatePolicy};
use crate::protocol::latin1;
use crate::sin::{dispatch_sin, sin_image_name};
use crate::tafile::{self, TaRecord};
use crate::{
  Callback, Engine, Error, Event, Result, Transport, UsbTransport, BOTH_SLOT_IMAGES, PROTECTED_TA_UNITS,
};

/// Options for a flashing run.
#[derive(Debug, Clone)]
pub struct FlashOptions {
  /// Test level: `0` runs everything, `1..100` uploads payloads but skips
  /// destructive commands, `>= 100` validates the firmware directory with
  /// no device attached.
  pub test: u32,
  pub read_timeout_ms: u64,
  pub write_timeout_ms: u64,
  /// Timeout for the final `Sync` command, in seconds.
  pub sync_timeout_secs: u64,
  /// Also process files that `update.xml` marks `NOERASE`.
  pub erase_user_data: bool,
}

impl Default for FlashOptions {
  fn default() -> Self {
    FlashOptions {
      test: 1,
      read_timeout_ms: 4000,
      write_timeout_ms: 4000,
      sync_timeout_secs: 30,
      erase_user_data: false,
    }
  }
}

/// Phases of a stock flash, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
  Connect,
  Repartition,
  Images,
  TaFiles,
  Boot,
  SetSlot,
  Sync,
  Logs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlashState {
  Disconnected,
  VarsLoaded,
  Flashing,
  Synced,
}

/// Device variables cached right after connecting.
///
/// Values the loader refuses to report stay `None`; the phases that need
/// them fail with a typed error instead.
#[derive(Debug, Clone, Default)]
pub struct DeviceVars {
  pub max_download_size: usize,
  pub sector_size: Option<i64>,
  pub product: Option<String>,
  pub version: Option<String>,
  pub bootloader_version: Option<String>,
  pub baseband_version: Option<String>,
  pub serialno: Option<String>,
  pub secure: Option<String>,
  pub loader_version: Option<String>,
  pub phone_id: Option<String>,
  pub device_id: Option<String>,
  pub platform_id: Option<String>,
  pub rooting_status: Option<String>,
  pub ufs_info: Option<String>,
  pub emmc_info: Option<String>,
  pub default_security: Option<String>,
  pub keystore_counter: Option<i64>,
  pub security_state: Option<String>,
  pub s1_root: Option<String>,
  pub sake_root: Option<String>,
  pub root_key_hash: Option<Vec<u8>>,
  pub slot_count: Option<i64>,
  pub current_slot: Option<String>,
  pub battery_level: Option<i64>,
}

/// Orchestrates a stock firmware flash out of a working directory.
///
/// One `Flasher` owns one device session. The flash-mode bit is treated
/// as a resource: it is released best-effort on the error path and from
/// `Drop`, so an interrupted run leaves the device reflashable.
pub struct Flasher {
  engine: Option<Engine<UsbTransport>>,
  wdir: PathBuf,
  opts: FlashOptions,
  vars: DeviceVars,
  update_policy: UpdatePolicy,
  state: FlashState,
  flashmode: bool,
  current_slot: Option<String>,
  flash_both_slots: bool,
  callback: Option<Callback>,
}

impl Flasher {
  /// Create a new Flasher over a firmware directory.
  ///
  /// NOTE: the phone is expected to be plugged in at the time
  /// [`Flasher::flash`] is called, not at creation.
  pub fn from_directory(path: PathBuf, opts: FlashOptions, callback: Option<Callback>) -> Result<Self> {
    tracing::debug!("creating new flasher for directory {:?}", &path);
    if !path.is_dir() {
      return Err(Error::State(format!("{:?} is not a directory", path)));
    }

    Ok(Flasher {
      engine: None,
      wdir: path,
      opts,
      vars: DeviceVars::default(),
      update_policy: UpdatePolicy::default(),
      state: FlashState::Disconnected,
      flashmode: false,
      current_slot: None,
      flash_both_slots: false,
      callback,
    })
  }

  pub fn vars(&self) -> &DeviceVars {
    &self.vars
  }

  fn emit(&self, event: Event) {
    if let Some(callback) = &self.callback {
      callback(event);
    }
  }

  fn phase(&self, phase: FlashPhase) {
    tracing::trace!("entering phase {:?}", phase);
    self.emit(Event::Phase(phase));
  }

  fn engine(&mut self) -> Result<&mut Engine<UsbTransport>> {
    self
      .engine
      .as_mut()
      .ok_or_else(|| Error::State("device is not connected".into()))
  }

  /// Open the transport, resynchronise the stream, read the device
  /// variables and probe the `signature:<size>` capability.
  pub fn connect(&mut self) -> Result<()> {
    if self.state != FlashState::Disconnected {
      return Err(Error::State("already connected".into()));
    }
    self.phase(FlashPhase::Connect);

    if self.opts.test < 100 {
      self.emit(Event::FindingDevice);
      self.emit(Event::Connecting);
      let transport = UsbTransport::open()?;
      let mut engine = Engine::new(transport);
      engine.set_timeouts(
        Duration::from_millis(self.opts.read_timeout_ms),
        Duration::from_millis(self.opts.write_timeout_ms),
      );
      engine.resync()?;
      self.emit(Event::Connected);
      self.engine = Some(engine);
    }

    self.init_vars()?;

    if let Some(engine) = self.engine.as_mut() {
      engine.check_signature_cmd()?;
    }

    self.state = FlashState::VarsLoaded;
    Ok(())
  }

  fn init_vars(&mut self) -> Result<()> {
    if self.opts.test >= 100 {
      // offline validation profile
      self.vars = DeviceVars {
        max_download_size: 400_000_000,
        sector_size: Some(0x1000),
        ufs_info: Some("__UFS__".to_string()),
        default_security: Some("OFF".to_string()),
        slot_count: Some(2),
        current_slot: Some("a".to_string()),
        ..DeviceVars::default()
      };
      self.current_slot = self.vars.current_slot.clone();
      self.flash_both_slots = true;
      return Ok(());
    }

    let engine = self
      .engine
      .as_mut()
      .ok_or_else(|| Error::State("device is not connected".into()))?;

    let mut vars = DeviceVars {
      max_download_size: engine.max_download_size,
      ..DeviceVars::default()
    };
    vars.sector_size = engine.try_getvar_int("Sector-size")?;
    vars.product = engine.try_getvar("product")?;
    vars.version = engine.try_getvar("version")?;
    vars.bootloader_version = engine.try_getvar("version-bootloader")?;
    vars.baseband_version = engine.try_getvar("version-baseband")?;
    vars.serialno = engine.try_getvar("serialno")?;
    vars.secure = engine.try_getvar("secure")?;
    vars.loader_version = engine.try_getvar("Loader-version")?;
    vars.phone_id = engine.try_getvar("Phone-id")?;
    vars.device_id = engine.try_getvar("Device-id")?;
    vars.platform_id = engine.try_getvar("Platform-id")?;
    vars.rooting_status = engine.try_getvar("Rooting-status")?;
    vars.ufs_info = engine.try_getvar("Ufs-info")?;
    vars.emmc_info = engine.try_getvar("Emmc-info")?;
    vars.default_security = engine.try_getvar("Default-security")?;
    vars.keystore_counter = engine.try_getvar_int("Keystore-counter")?;
    vars.security_state = engine.try_getvar("Security-state")?;

    // probe-only reads; some loaders refresh RPMB state on access
    engine.try_getvar("Stored-security-state")?;
    engine.try_getvar("Keystore-xcs")?;

    vars.s1_root = engine.try_getvar("S1-root")?;
    vars.sake_root = engine.try_getvar("Sake-root")?;
    vars.root_key_hash = match engine.command("Get-root-key-hash") {
      Ok(hash) => Some(hash),
      Err(Error::DeviceFail(_)) => None,
      Err(e) => return Err(e),
    };
    vars.slot_count = engine.try_getvar_int("slot-count")?;
    vars.current_slot = engine.try_getvar("current-slot")?;
    vars.battery_level = engine.try_getvar_int("Battery")?;
    engine.try_getvar("Frp-partition")?;
    engine.try_getvar("X-conf")?;
    engine.try_getvar("Soc-unique-id")?;

    // bootloader, bluetooth, dsp, modem and rdimage go to both slots
    self.flash_both_slots = vars.slot_count == Some(2);
    self.current_slot = vars.current_slot.clone();
    self.vars = vars;
    Ok(())
  }

  fn check_battery(&self) {
    let Some(level) = self.vars.battery_level else { return };
    // above 1150 the loader reports millivolts, below it percent
    let (low, units) = if level > 1150 {
      (level < 3750, " mV")
    } else {
      (level < 17, "%")
    };
    if low {
      tracing::warn!(
        "your battery level is {}{}; a fully discharged battery during the flash session can hard-brick the device",
        level,
        units
      );
    }
  }

  fn change_flashmode(&mut self, active: bool) -> Result<()> {
    if active {
      tracing::info!("flash mode activation...");
    } else {
      tracing::info!("flash mode deactivation...");
    }
    if self.opts.test > 0 {
      tracing::info!("  skip (test = {})", self.opts.test);
      return Ok(());
    }

    let data: [u8; 1] = if active { [0x01] } else { [0x00] };
    self.engine()?.write_ta("FLASH_MODE", &data)?;
    self.flashmode = active;
    Ok(())
  }

  fn activate_flashmode(&mut self) -> Result<()> {
    if self.state != FlashState::VarsLoaded {
      return Err(Error::State("flash mode activation requires a connected session".into()));
    }
    self.change_flashmode(true)?;
    self.state = FlashState::Flashing;
    Ok(())
  }

  fn deactivate_flashmode(&mut self) -> Result<()> {
    self.change_flashmode(false)
  }

  /// Release path for the flash-mode bit: short timeouts, errors
  /// swallowed. Called on the error path and from `Drop`.
  fn deactivate_flashmode_best_effort(&mut self) {
    if !self.flashmode {
      return;
    }
    if let Some(engine) = self.engine.as_mut() {
      let saved = engine.timeouts();
      engine.set_timeouts(Duration::from_millis(200), Duration::from_millis(200));
      match engine.write_ta("FLASH_MODE", &[0x00]) {
        Ok(()) => {
          self.flashmode = false;
          tracing::info!("flash mode deactivated");
        }
        Err(err) => tracing::warn!("best-effort flash mode deactivation failed: {}", err),
      }
      engine.set_timeouts(saved.0, saved.1);
    }
  }

  /// Flash the firmware directory to the device.
  pub fn flash(&mut self) -> Result<()> {
    match self.run_flash() {
      Ok(()) => Ok(()),
      Err(err) => {
        tracing::error!("flashing failed: {}", err);
        self.deactivate_flashmode_best_effort();
        Err(err)
      }
    }
  }

  fn run_flash(&mut self) -> Result<()> {
    self.connect()?;
    self.check_battery();

    tracing::info!("firmware directory: {:?}", self.wdir);
    tracing::info!("test = {}", self.opts.test);

    self.update_policy = UpdatePolicy::load(&self.wdir)?;

    self.activate_flashmode()?;
    if self.opts.test == 0 {
      let _ = self.dump_error_log();
    }

    self.repartition()?;
    self.flash_image_sins()?;
    self.apply_ta_files()?;
    self.flash_boot()?;
    self.set_active_slot()?;
    self.deactivate_flashmode()?;
    self.sync_device()?;
    self.state = FlashState::Synced;
    self.tail_logs();

    tracing::info!("======= flashing completed ======= test: {}", self.opts.test);
    Ok(())
  }

  /// Dispatch one SIN, honoring the `NOERASE` policy.
  fn dispatch(&mut self, path: &Path, aux_cmd: &str) -> Result<()> {
    let fname = file_name(path);
    if self.update_policy.is_noerase(&fname) && !self.opts.erase_user_data {
      tracing::debug!("  skip SIN file {:?}: marked NOERASE and erase_user_data is off", fname);
      return Ok(());
    }

    self.emit(Event::SinFile(fname));
    let current_slot = self.current_slot.clone();
    dispatch_sin(
      self.engine.as_mut(),
      path,
      aux_cmd,
      current_slot.as_deref(),
      self.opts.test,
    )
  }

  fn repartition(&mut self) -> Result<()> {
    self.phase(FlashPhase::Repartition);

    let pdir = self.wdir.join("partition");
    if !pdir.is_dir() {
      tracing::warn!("directory {:?} not found", pdir);
      return Ok(());
    }

    let images = delivery::load_partition_delivery(&pdir)?;
    if images.is_empty() {
      return Err(Error::parse(pdir.display().to_string(), "no partition SIN files found"));
    }

    tracing::info!("repartitioning...");
    let use_ufs = self.vars.ufs_info.as_deref().is_some_and(|info| !info.is_empty());
    let (stor_name, info_cmd) = if use_ufs {
      ("LUN0", "Get-ufs-info")
    } else {
      ("EMMC_part_0", "Get-emmc-info")
    };

    tracing::info!("determining {} size...", stor_name);
    let lun0_kib: u64 = if self.opts.test >= 100 {
      0x10
    } else {
      let info = self.engine()?.command(info_cmd)?;
      if info.len() < 0x20 {
        return Err(Error::proto(format!("error receiving {} header", stor_name)));
      }
      let size = if use_ufs {
        // sector count sits past the variable-length UFS descriptor
        let pos = info[0] as usize + 0x1C;
        read_u32(&info, pos, false).ok_or_else(|| Error::proto(format!("error receiving {} size", stor_name)))?
      } else {
        read_u32(&info, 0xD4, true).ok_or_else(|| Error::proto(format!("error receiving {} size", stor_name)))?
      };
      let sector = self
        .vars
        .sector_size
        .filter(|&s| s > 0)
        .ok_or_else(|| Error::proto("cannot determine sector size"))? as u64;
      u64::from(size) * sector / 1024
    };
    tracing::info!("{} size = 0x{:X} ({})", stor_name, lun0_kib, lun0_kib);

    if lun0_kib == 0 {
      return Ok(());
    }

    let lun0_tag = format!("LUN0_{}_", lun0_kib);
    for path in &images {
      let fname = file_name(path);
      tracing::info!("processing part: {:?}", fname);
      if !["LUN0", "LUN1", "LUN2", "LUN3"].iter().any(|lun| fname.contains(lun)) {
        tracing::warn!("  skipping partition {:?} (incorrect name)", fname);
        continue;
      }
      if fname.contains("LUN0") && !fname.contains(&lun0_tag) && !fname.contains("LUN0_X-FLASH-ALL") {
        tracing::warn!("  skipping partition {:?} (incorrect name)", fname);
        continue;
      }
      self.dispatch(path, "Repartition")?;
    }
    Ok(())
  }

  fn flash_image_sins(&mut self) -> Result<()> {
    self.phase(FlashPhase::Images);

    for path in sorted_dir(&self.wdir)? {
      let fname = file_name(&path);
      let lower = fname.to_lowercase();
      if !lower.ends_with(".sin") || lower.contains("partition") || lower.contains("persist") {
        continue;
      }

      tracing::info!("processing {:?} ...", fname);
      let imgname = sin_image_name(&path)?;

      if self.flash_both_slots && BOTH_SLOT_IMAGES.contains(&imgname.as_str()) {
        let remembered = self.current_slot.clone();
        self.current_slot = match remembered.as_deref() {
          Some("a") => Some("b".to_string()),
          _ => Some("a".to_string()),
        };
        let other = self.dispatch(&path, "flash");
        self.current_slot = remembered;
        other?;
      }

      if self.opts.test >= 101 && std::fs::metadata(&path)?.len() > 200_000_000 {
        tracing::info!("  skip SIN {:?}, too large (test = {})", fname, self.opts.test);
        continue;
      }

      self.dispatch(&path, "flash")?;
    }
    Ok(())
  }

  fn apply_ta_files(&mut self) -> Result<()> {
    self.phase(FlashPhase::TaFiles);

    for path in sorted_dir(&self.wdir)? {
      let fname = file_name(&path);
      if !fname.ends_with(".ta") {
        continue;
      }
      tracing::info!("processing {:?} ...", fname);
      if self.update_policy.is_noerase(&fname) && !self.opts.erase_user_data {
        tracing::debug!("  skip TA file {:?}: marked NOERASE and erase_user_data is off", fname);
        continue;
      }
      // stray TA dumps in the root would rewrite half the store; cap
      // loose files at a single unit
      self.process_ta(&path, Some(1))?;
    }
    Ok(())
  }

  fn process_ta(&mut self, path: &Path, max_units: Option<usize>) -> Result<()> {
    let fname = file_name(path);
    self.emit(Event::TaFile(fname.clone()));
    tracing::info!("process TA file {:?} ...", fname);

    let records = tafile::load_ta_file(path)?;
    if records.is_empty() {
      return Err(Error::parse(path.display().to_string(), "no TA records"));
    }
    if let Some(max) = max_units {
      if records.len() > max {
        return Err(Error::parse(
          path.display().to_string(),
          format!("too many units: {}, expected <= {}", records.len(), max),
        ));
      }
    }

    write_ta_records(self.engine.as_mut(), &records, self.opts.test)
  }

  fn flash_boot(&mut self) -> Result<()> {
    self.phase(FlashPhase::Boot);

    let bootdir = self.wdir.join("boot");
    if !bootdir.is_dir() {
      return Err(Error::parse(bootdir.display().to_string(), "directory not found"));
    }

    let bd = BootDelivery::load(&bootdir)?;
    tracing::info!("boot delivery product: {}", bd.product);
    tracing::info!("boot delivery version: {}", bd.version);
    tracing::info!("verifying if boot delivery matches the device...");

    let default_security = self
      .vars
      .default_security
      .clone()
      .ok_or_else(|| Error::proto("Default-security unknown, cannot select a boot configuration"))?;
    let platform_id = self.vars.platform_id.clone().unwrap_or_default();
    let root_key_hash = self.vars.root_key_hash.clone().unwrap_or_default();
    if default_security != "OFF" && (platform_id.is_empty() || root_key_hash.is_empty()) {
      return Err(Error::proto("Platform-id or root key hash unknown, cannot select a boot configuration"));
    }

    let conf = bd.select_config(&default_security, &platform_id, &root_key_hash)?.clone();
    tracing::info!("found boot delivery match: {:?}", conf.name);
    if let Ok(dump) = serde_json::to_string_pretty(&conf) {
      tracing::debug!("boot delivery selected configuration:\n{}", dump);
    }

    if conf.boot_images.is_empty() {
      return Err(Error::parse(bootdir.display().to_string(), "no SIN file for the boot image"));
    }
    if conf.boot_images.len() > 1 {
      return Err(Error::parse(bootdir.display().to_string(), "cannot flash several boot images"));
    }

    for ta_name in &conf.boot_config {
      if !ta_name.ends_with(".ta") {
        return Err(Error::parse(
          bootdir.display().to_string(),
          format!("incorrect TA file name {:?}", ta_name),
        ));
      }
      tracing::info!("processing \"boot/{}\" ...", ta_name);
      self.process_ta(&bootdir.join(ta_name), None)?;
    }

    let boot_sin = &conf.boot_images[0];
    let boot_path = bootdir.join(boot_sin);
    if !boot_path.is_file() {
      return Err(Error::parse(boot_path.display().to_string(), "file not found"));
    }

    tracing::info!("processing \"boot/{}\" ...", boot_sin);
    let imgname = sin_image_name(&boot_path)?;
    if imgname != "bootloader" {
      return Err(Error::parse(
        boot_path.display().to_string(),
        format!("incorrect SIN image name {:?}", imgname),
      ));
    }
    self.dispatch(&boot_path, "flash")
  }

  fn set_active_slot(&mut self) -> Result<()> {
    self.phase(FlashPhase::SetSlot);
    if self.opts.test > 0 {
      return Ok(());
    }
    let Some(slot) = self.current_slot.clone() else {
      return Ok(());
    };
    self.engine()?.set_active_slot(&slot)?;
    tracing::info!("set slot {:?} active", slot);
    Ok(())
  }

  fn sync_device(&mut self) -> Result<()> {
    self.phase(FlashPhase::Sync);
    tracing::info!("sent command: \"Sync\" ...");
    if self.opts.test > 0 {
      tracing::info!("  skip \"Sync\" command (test = {})", self.opts.test);
      return Ok(());
    }

    let timeout = Duration::from_secs(self.opts.sync_timeout_secs);
    match self.engine()?.sync(timeout) {
      Ok(()) => tracing::info!("command \"Sync\" completed"),
      Err(err) => tracing::error!("command \"Sync\" failed: {}", err),
    }
    Ok(())
  }

  fn tail_logs(&mut self) {
    self.phase(FlashPhase::Logs);
    if self.opts.test >= 100 {
      return;
    }

    let _ = self.dump_error_log();

    match self.engine().and_then(|engine| engine.read_ta("FLASH_LOG")) {
      Ok(log) => tracing::debug!("firmware history log:\n{}", latin1(&log)),
      Err(err) => tracing::error!("cannot get FW history log: {}", err),
    }
  }

  /// Fetch the loader error log (`Getlog`) and save it under
  /// `<wdir>/logs/`.
  pub fn dump_error_log(&mut self) -> Result<Vec<u8>> {
    let log = match self.engine()?.getlog() {
      Ok(log) => log,
      Err(err) => {
        tracing::error!("cannot get s1boot logs: {}", err);
        return Err(err);
      }
    };
    self.save_log(&log, "error")?;
    Ok(log)
  }

  /// Fetch the last boot log (TA unit `LAST_BOOT_LOG`) and save it under
  /// `<wdir>/logs/`.
  pub fn dump_boot_log(&mut self) -> Result<Vec<u8>> {
    let log = match self.engine()?.read_ta("LAST_BOOT_LOG") {
      Ok(log) => log,
      Err(err) => {
        tracing::error!("cannot get boot logs: {}", err);
        return Err(err);
      }
    };
    self.save_log(&log, "bl")?;
    Ok(log)
  }

  fn save_log(&self, data: &[u8], kind: &str) -> Result<()> {
    let dir = self.wdir.join("logs");
    std::fs::create_dir_all(&dir)?;
    let stamp = chrono::Local::now().format("%Y-%m-%d__%H-%M-%S");
    let path = dir.join(format!("s1flash__{}__{}.log", stamp, kind));
    std::fs::write(&path, data)?;
    tracing::info!("file {:?} saved", path);
    Ok(())
  }

  /// Leave the loader by rebooting back into the bootloader. Only valid
  /// once the session has synced.
  pub fn reboot_bootloader(&mut self) -> Result<()> {
    if self.state != FlashState::Synced {
      return Err(Error::State("reboot-bootloader is only valid after Sync".into()));
    }
    if let Some(engine) = self.engine.as_mut() {
      engine.reboot_bootloader()?;
      tracing::info!("rebooting the device into bootloader mode");
    }
    self.engine = None;
    self.state = FlashState::Disconnected;
    Ok(())
  }
}

impl Drop for Flasher {
  fn drop(&mut self) {
    if self.flashmode {
      tracing::warn!("flash session ended with flash mode still active, deactivating");
      self.deactivate_flashmode_best_effort();
    }
  }
}

/// Write parsed TA records to the device, silently skipping the
/// protected partition-2 units.
fn write_ta_records<T: Transport>(
  mut engine: Option<&mut Engine<T>>,
  records: &[TaRecord],
  test: u32,
) -> Result<()> {
  for rec in records {
    if rec.part == 2 && PROTECTED_TA_UNITS.contains(&rec.code) {
      tracing::debug!("  skip TA unit [2:{}], unit is hardware specific", rec.code);
      continue;
    }
    tracing::info!("CMD: Write-TA:{}:{}   <size = {}>", rec.part, rec.code, rec.value.len());
    if test > 0 {
      tracing::info!("  skip write (test = {})", test);
      continue;
    }
    let Some(engine) = engine.as_deref_mut() else {
      return Err(Error::State("cannot write TA units without a connected device".into()));
    };
    engine.write_ta((rec.part, rec.code), &rec.value)?;
  }
  Ok(())
}

fn file_name(path: &Path) -> String {
  path
    .file_name()
    .map(|name| name.to_string_lossy().to_string())
    .unwrap_or_default()
}

fn sorted_dir(dir: &Path) -> Result<Vec<PathBuf>> {
  let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
    .filter_map(|entry| entry.ok())
    .map(|entry| entry.path())
    .filter(|path| path.is_file())
    .collect();
  entries.sort();
  Ok(entries)
}

fn read_u32(data: &[u8], pos: usize, little_endian: bool) -> Option<u32> {
  let bytes = data.get(pos..pos + 4)?;
  let mut word = [0u8; 4];
  word.copy_from_slice(bytes);
  Some(if little_endian {
    u32::from_le_bytes(word)
  } else {
    u32::from_be_bytes(word)
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tafile::TaRecord;
  use crate::testing::MockTransport;
  use std::io::Write;
  use std::sync::{Arc, Mutex};

  fn mock_engine(reads: Vec<Option<Vec<u8>>>) -> Engine<MockTransport> {
    Engine::new(MockTransport::new(reads))
  }

  fn okay(payload: &str) -> Option<Vec<u8>> {
    Some(format!("OKAY{}", payload).into_bytes())
  }

  fn data_echo(len: usize) -> Option<Vec<u8>> {
    Some(format!("DATA{:08X}", len).into_bytes())
  }

  #[test]
  fn test_protected_units_are_skipped_and_write_succeeds() {
    // one writable unit, every protected unit sandwiched around it
    let mut records: Vec<TaRecord> = PROTECTED_TA_UNITS
      .iter()
      .map(|&code| TaRecord { part: 2, code, value: vec![0xFF] })
      .collect();
    records.push(TaRecord { part: 2, code: 2486, value: vec![0x01] });

    let mut engine = mock_engine(vec![data_echo(1), okay(""), okay("")]);
    write_ta_records(Some(&mut engine), &records, 0).unwrap();

    let writes = engine.transport.written_strings();
    assert_eq!(
      writes
        .iter()
        .filter(|w| w.starts_with("Write-TA:"))
        .collect::<Vec<_>>(),
      vec!["Write-TA:2:2486"]
    );
  }

  #[test]
  fn test_protected_units_apply_to_partition_two_only() {
    // code 2010 is only protected in partition 2
    let records = vec![TaRecord { part: 1, code: 2010, value: vec![0x00] }];
    let mut engine = mock_engine(vec![data_echo(1), okay(""), okay("")]);
    write_ta_records(Some(&mut engine), &records, 0).unwrap();
    assert!(engine
      .transport
      .written_strings()
      .contains(&"Write-TA:1:2010".to_string()));
  }

  #[test]
  fn test_dry_run_writes_nothing() {
    let records = vec![TaRecord { part: 2, code: 2486, value: vec![0x01] }];
    let mut engine = mock_engine(vec![]);
    write_ta_records(Some(&mut engine), &records, 1).unwrap();
    assert!(engine.transport.writes.is_empty());
  }

  #[test]
  fn test_reboot_requires_synced_state() {
    let dir = test_dir("reboot-state");
    let mut flasher = Flasher::from_directory(dir, FlashOptions::default(), None).unwrap();
    assert!(matches!(flasher.reboot_bootloader(), Err(Error::State(_))));
  }

  #[test]
  fn test_from_directory_rejects_files() {
    let dir = test_dir("not-a-dir");
    let file = dir.join("file.txt");
    std::fs::write(&file, b"x").unwrap();
    assert!(Flasher::from_directory(file, FlashOptions::default(), None).is_err());
  }

  // --- offline end-to-end validation -----------------------------------

  fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("s1flash-flash-tests-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }

  fn write_tar(path: &Path, entries: &[(&str, &[u8])]) {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
      let mut header = tar::Header::new_ustar();
      header.set_size(data.len() as u64);
      header.set_mode(0o644);
      builder.append_data(&mut header, name, *data).unwrap();
    }
    std::fs::write(path, builder.into_inner().unwrap()).unwrap();
  }

  const CMS: &[u8] = b"\x30\x82\x01\x00cms-payload";

  fn build_firmware_dir(name: &str) -> PathBuf {
    let dir = test_dir(name);

    write_tar(&dir.join("apps.sin"), &[("apps.cms", CMS), ("apps.img", b"apps-image")]);

    let pdir = dir.join("partition");
    std::fs::create_dir_all(&pdir).unwrap();
    write_tar(
      &pdir.join("partitionimage_0_LUN0_X-FLASH-ALL-0001.sin"),
      &[("partitionimage_0.cms", CMS), ("partitionimage_0.img", b"gpt-image")],
    );
    let mut manifest = std::fs::File::create(pdir.join("partition_delivery.xml")).unwrap();
    manifest
      .write_all(
        b"<PARTITION_DELIVERY FORMAT=\"1\">\n  <PARTITION_IMAGES>\n    \
          <FILE PATH=\"partitionimage_0_LUN0_X-FLASH-ALL-0001.sin\"/>\n  </PARTITION_IMAGES>\n</PARTITION_DELIVERY>\n",
      )
      .unwrap();

    std::fs::write(dir.join("reset-flags.ta"), b"02\n09B6 0001 01\n").unwrap();

    let bootdir = dir.join("boot");
    std::fs::create_dir_all(&bootdir).unwrap();
    write_tar(
      &bootdir.join("bootloader_S1_OFF.sin"),
      &[("bootloader.cms", CMS), ("bootloader.img", b"xboot-image")],
    );
    std::fs::write(bootdir.join("security_off.ta"), b"02\n08FD 0001 00\n").unwrap();
    std::fs::write(
      bootdir.join("boot_delivery.xml"),
      b"<BOOT_DELIVERY FORMAT=\"2\" PRODUCT=\"pdx234\" SPACE_ID=\"S1\" VERSION=\"1\">\n\
        <CONFIGURATION NAME=\"SECURITY_OFF\">\n\
          <BOOT_CONFIG><FILE PATH=\"security_off.ta\"/></BOOT_CONFIG>\n\
          <BOOT_IMAGES><FILE PATH=\"bootloader_S1_OFF.sin\"/></BOOT_IMAGES>\n\
          <ATTRIBUTES VALUE=\"DEFAULT_SECURITY=OFF\"/>\n\
        </CONFIGURATION>\n</BOOT_DELIVERY>\n",
    )
    .unwrap();

    std::fs::write(
      dir.join("update.xml"),
      b"<UPDATE><NOERASE>userdata.sin</NOERASE></UPDATE>\n",
    )
    .unwrap();

    dir
  }

  #[test]
  fn test_offline_validation_walks_all_phases() {
    let dir = build_firmware_dir("offline-ok");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: crate::Callback = Arc::new(move |event| {
      if let Event::Phase(phase) = event {
        sink.lock().unwrap().push(phase);
      }
    });

    let opts = FlashOptions { test: 100, ..FlashOptions::default() };
    let mut flasher = Flasher::from_directory(dir, opts, Some(callback)).unwrap();
    flasher.flash().unwrap();

    let phases = seen.lock().unwrap().clone();
    assert_eq!(
      phases,
      vec![
        FlashPhase::Connect,
        FlashPhase::Repartition,
        FlashPhase::Images,
        FlashPhase::TaFiles,
        FlashPhase::Boot,
        FlashPhase::SetSlot,
        FlashPhase::Sync,
        FlashPhase::Logs,
      ]
    );
  }

  #[test]
  fn test_offline_validation_catches_bad_boot_image() {
    let dir = build_firmware_dir("offline-bad-boot");
    // boot image whose first entry is not "bootloader"
    write_tar(
      &dir.join("boot").join("bootloader_S1_OFF.sin"),
      &[("kernel.cms", CMS), ("kernel.img", b"kernel-image")],
    );

    let opts = FlashOptions { test: 100, ..FlashOptions::default() };
    let mut flasher = Flasher::from_directory(dir, opts, None).unwrap();
    assert!(flasher.flash().is_err());
  }

  #[test]
  fn test_offline_validation_catches_oversized_root_ta() {
    let dir = build_firmware_dir("offline-fat-ta");
    // two units in a root TA file, the cap is one
    std::fs::write(dir.join("reset-flags.ta"), b"02\n09B6 0001 01\n0907 0001 00\n").unwrap();

    let opts = FlashOptions { test: 100, ..FlashOptions::default() };
    let mut flasher = Flasher::from_directory(dir, opts, None).unwrap();
    assert!(flasher.flash().is_err());
  }
}
