//! Catalogue of known Trim Area units, extracted from observed S1 loader
//! behavior across Xperia firmware generations.
//!
//! The catalogue is data, not truth: loaders happily serve units that are
//! not listed here, and unit names are only firmware-observable. Callers
//! with better knowledge can build their own [`TaRegistry`].

use lazy_static::lazy_static;
use std::collections::HashMap;

use crate::{Error, Result};

/// One catalogued Trim Area unit.
#[derive(Debug, Clone)]
pub struct TaUnit {
  /// TA partition, 1 or 2
  pub part: u8,
  /// Unit number within the partition
  pub code: u32,
  /// Upper-case symbolic name, unique across the catalogue
  pub name: String,
  /// Free-form description
  pub doc: String,
}

/// The three ways callers address a TA unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaAddr {
  /// Symbolic catalogue name, matched case-insensitively
  Name(String),
  /// Bare unit number, interpreted as partition 2
  Code(u32),
  /// Explicit `(partition, code)` pair
  Unit(u8, u32),
}

impl From<&str> for TaAddr {
  fn from(name: &str) -> Self {
    TaAddr::Name(name.to_string())
  }
}

impl From<u32> for TaAddr {
  fn from(code: u32) -> Self {
    TaAddr::Code(code)
  }
}

impl From<(u8, u32)> for TaAddr {
  fn from((part, code): (u8, u32)) -> Self {
    TaAddr::Unit(part, code)
  }
}

/// Unit catalogue with address resolution.
///
/// Uniqueness is enforced at construction: no two units may share a name,
/// and no two units may share a `(partition, code)` pair.
pub struct TaRegistry {
  units: Vec<TaUnit>,
  by_name: HashMap<String, (u8, u32)>,
  by_addr: HashMap<(u8, u32), String>,
}

impl TaRegistry {
  pub fn new(units: Vec<TaUnit>) -> Result<Self> {
    let mut by_name = HashMap::new();
    let mut by_addr = HashMap::new();

    for unit in &units {
      let name = unit.name.to_uppercase();
      if name.is_empty() {
        return Err(Error::parse(
          "ta-catalogue",
          format!("unit [{}:{}] has no name", unit.part, unit.code),
        ));
      }
      if by_name.insert(name.clone(), (unit.part, unit.code)).is_some() {
        return Err(Error::parse("ta-catalogue", format!("duplicate unit name {:?}", unit.name)));
      }
      if by_addr.insert((unit.part, unit.code), name).is_some() {
        return Err(Error::parse(
          "ta-catalogue",
          format!("duplicate unit address [{}:{}]", unit.part, unit.code),
        ));
      }
    }

    Ok(TaRegistry { units, by_name, by_addr })
  }

  /// The built-in catalogue.
  pub fn builtin() -> &'static TaRegistry {
    &BUILTIN
  }

  /// Resolve an address to its `(partition, code)` pair. Unknown codes are
  /// legal; only unknown *names* fail.
  pub fn resolve(&self, addr: &TaAddr) -> Result<(u8, u32)> {
    match addr {
      TaAddr::Name(name) => self
        .by_name
        .get(&name.to_uppercase())
        .copied()
        .ok_or_else(|| Error::State(format!("unknown TA unit name {:?}", name))),
      TaAddr::Code(code) => Ok((2, *code)),
      TaAddr::Unit(part, code) => Ok((*part, *code)),
    }
  }

  /// Symbolic name for an address, or `""` for uncatalogued units.
  pub fn name_of(&self, part: u8, code: u32) -> &str {
    self.by_addr.get(&(part, code)).map(String::as_str).unwrap_or("")
  }

  pub fn find(&self, name: &str) -> Option<&TaUnit> {
    let addr = *self.by_name.get(&name.to_uppercase())?;
    self.units.iter().find(|u| (u.part, u.code) == addr)
  }

  pub fn units(&self) -> &[TaUnit] {
    &self.units
  }
}

lazy_static! {
  static ref BUILTIN: TaRegistry =
    TaRegistry::new(builtin_units()).expect("builtin TA catalogue is consistent");
}

#[rustfmt::skip]
const BUILTIN_UNITS: &[(u8, u32, &str, &str)] = &[
  (1, 1877,  "RF_BC_CFG",                      ""),
  (1, 6828,  "LTE_BC_CFG",                     ""),

  (2, 2002,  "FLA_FLA",                        ""),
  (2, 2003,  "S1_LDR",                         "hardware configuration"),
  (2, 2010,  "SENS_DATA",                      "simlock and bootloader-unlock state"),
  (2, 2021,  "DRM_KEY_STATUS",                 ""),
  (2, 2022,  "BLOB_0",                         "marlin"),
  (2, 2023,  "BLOB_1",                         "ckb"),
  (2, 2024,  "BLOB_2",                         "widevine"),
  (2, 2025,  "BLOB_3",                         ""),
  (2, 2036,  "BLOB_E",                         ""),
  (2, 2040,  "SRM",                            ""),
  (2, 2050,  "LAST_BOOT_LOG",                  ""),
  (2, 2141,  "MACHINE_ID",                     ""),
  (2, 2202,  "SW_VER",                         ""),
  (2, 2205,  "CUST_VER",                       ""),
  (2, 2206,  "FS_VER",                         ""),
  (2, 2207,  "S1_BOOT_VER",                    ""),
  (2, 2209,  "BUILD_TYPE",                     ""),
  (2, 2210,  "PHONE_NAME",                     ""),
  (2, 2212,  "AC_VER",                         "zeroed by cust-reset.ta, one byte"),
  (2, 2226,  "BL_UNLOCKCODE",                  "the RCK"),
  (2, 2227,  "STARTUP_SHUTDOWNRESULT",         ""),
  (2, 2237,  "RESET_LOCK_STATUS",              ""),
  (2, 2301,  "STARTUP_REASON",                 "override unit"),
  (2, 2311,  "DISABLE_CHARGE_ONLY",            ""),
  (2, 2316,  "DISABLE_CHARGE_ONLY_ENTERPRISE", "zeroed by auto-boot.ta, one byte"),
  (2, 2330,  "OSV_RESTRICTION",                "one byte"),
  (2, 2404,  "FOTA_INTERNAL",                  "modem customization config"),
  (2, 2473,  "KERNEL_CMD_DEBUG_MASK",          "one byte"),
  (2, 2475,  "FLASH_LOG",                      "firmware history log"),
  (2, 2486,  "ENABLE_NONSECURE_USB_DEBUG",     ""),
  (2, 2500,  "CREDMGR_KEYTABLE_PRESET",        ""),
  (2, 2550,  "MASTER_RESET",                   ""),
  (2, 2551,  "BASEBAND_CFG",                   "config held by the modem"),
  (2, 2553,  "WIPE_REASON",                    ""),
  (2, 2560,  "WIFI_MAC",                       ""),
  (2, 2568,  "BLUETOOTH_MAC",                  ""),
  (2, 4900,  "SERIAL_NO",                      ""),
  (2, 4901,  "PBA_ID",                         ""),
  (2, 4902,  "PBA_ID_REV",                     ""),
  (2, 4908,  "PP_SEMC_ITP_PRODUCT_NO",         ""),
  (2, 4909,  "PP_SEMC_ITP_REV",                ""),
  (2, 10100, "FLASH_MODE",                     "device-side write enable for flash sessions"),
  (2, 66667, "DEVICE_KEY",                     "device key and DRM keys"),
  (2, 66668, "REMOTE_LOCK",                    ""),
];

fn builtin_units() -> Vec<TaUnit> {
  BUILTIN_UNITS
    .iter()
    .map(|&(part, code, name, doc)| TaUnit {
      part,
      code,
      name: name.to_string(),
      doc: doc.to_string(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_builtin_catalogue_is_consistent() {
    let reg = TaRegistry::builtin();
    assert!(!reg.units().is_empty());
  }

  #[test]
  fn test_lookups_commute() {
    let reg = TaRegistry::builtin();
    for unit in reg.units() {
      let addr = TaAddr::Name(unit.name.clone());
      assert_eq!(reg.resolve(&addr).unwrap(), (unit.part, unit.code));
      assert_eq!(reg.name_of(unit.part, unit.code), unit.name);
    }
  }

  #[test]
  fn test_name_resolution_is_case_insensitive() {
    let reg = TaRegistry::builtin();
    assert_eq!(reg.resolve(&TaAddr::from("flash_mode")).unwrap(), (2, 10100));
    let unit = reg.find("flash_mode").unwrap();
    assert_eq!((unit.part, unit.code), (2, 10100));
  }

  #[test]
  fn test_integer_addr_means_partition_two() {
    let reg = TaRegistry::builtin();
    assert_eq!(reg.resolve(&TaAddr::from(2475u32)).unwrap(), (2, 2475));
  }

  #[test]
  fn test_pair_addr_is_identity() {
    let reg = TaRegistry::builtin();
    assert_eq!(reg.resolve(&TaAddr::from((1u8, 1877u32))).unwrap(), (1, 1877));
  }

  #[test]
  fn test_unknown_codes_have_empty_name() {
    let reg = TaRegistry::builtin();
    assert_eq!(reg.name_of(2, 999_999), "");
  }

  #[test]
  fn test_unknown_name_is_an_error() {
    let reg = TaRegistry::builtin();
    assert!(reg.resolve(&TaAddr::from("NO_SUCH_UNIT")).is_err());
  }

  #[test]
  fn test_duplicate_names_are_rejected() {
    let units = vec![
      TaUnit { part: 2, code: 1, name: "X".into(), doc: String::new() },
      TaUnit { part: 2, code: 2, name: "x".into(), doc: String::new() },
    ];
    assert!(TaRegistry::new(units).is_err());
  }

  #[test]
  fn test_duplicate_addresses_are_rejected() {
    let units = vec![
      TaUnit { part: 2, code: 1, name: "X".into(), doc: String::new() },
      TaUnit { part: 2, code: 1, name: "Y".into(), doc: String::new() },
    ];
    assert!(TaRegistry::new(units).is_err());
  }
}
