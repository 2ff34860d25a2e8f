//! Parsers for the XML delivery manifests shipped inside a firmware
//! directory, and the boot-configuration match against device identity.

use serde::Serialize;
use simple_xml::Node;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// A parsed `boot_delivery.xml`.
///
/// Configurations keep document order: selection is first-match.
#[derive(Debug, Clone)]
pub struct BootDelivery {
  pub format: u32,
  pub product: String,
  pub space_id: String,
  pub version: String,
  pub configs: Vec<BootConfig>,
  origin: String,
}

/// One `CONFIGURATION` block of a boot delivery.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Debug, Clone)]
pub struct BootConfig {
  pub name: String,
  /// TA files applied before the boot image
  pub boot_config: Vec<String>,
  /// SIN files carrying the boot image
  pub boot_images: Vec<String>,
  /// `ATTRIBUTES@VALUE` key/value pairs (`DEFAULT_SECURITY`,
  /// `PLATFORM_ID`, `PLF_ROOT_HASH`, ...)
  pub attrs: HashMap<String, String>,
  pub hwconf: Option<HwConfig>,
  pub keystore: Option<Keystore>,
  pub sec_prop: Option<SecurityProperties>,
  pub sec_state: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct HwConfig {
  pub cert: String,
  pub rev: String,
  pub ver: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct Keystore {
  pub cert: String,
  pub rev: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct SecurityProperties {
  pub rev: String,
}

impl BootDelivery {
  /// Parse `<bootdir>/boot_delivery.xml`. Unlike the partition delivery,
  /// a missing boot delivery is fatal.
  pub fn load(bootdir: &Path) -> Result<Self> {
    let path = bootdir.join("boot_delivery.xml");
    if !path.is_file() {
      return Err(Error::parse(path.display().to_string(), "file not found"));
    }
    let text = std::fs::read_to_string(&path)?;
    Self::parse(&text, &path.display().to_string())
  }

  pub fn parse(text: &str, origin: &str) -> Result<Self> {
    let doc = parse_xml(text, origin)?;
    let root = document_root(&doc, "BOOT_DELIVERY", origin)?;

    let format = attr(root, "FORMAT", origin)?
      .parse::<u32>()
      .map_err(|_| Error::parse(origin, "FORMAT is not a number"))?;

    let mut configs = vec![];
    for conf in children(root, "CONFIGURATION") {
      configs.push(parse_config(conf, origin)?);
    }

    Ok(BootDelivery {
      format,
      product: attr(root, "PRODUCT", origin)?.to_string(),
      space_id: attr(root, "SPACE_ID", origin)?.to_string(),
      version: attr(root, "VERSION", origin)?.to_string(),
      configs,
      origin: origin.to_string(),
    })
  }

  /// Pick the configuration matching the device identity.
  ///
  /// With security off, the first `DEFAULT_SECURITY=OFF` configuration
  /// wins. Otherwise the platform id (first byte masked to `00`) and the
  /// root-key hash must both match.
  pub fn select_config(
    &self,
    default_security: &str,
    platform_id: &str,
    root_key_hash: &[u8],
  ) -> Result<&BootConfig> {
    if default_security == "OFF" {
      for conf in &self.configs {
        if conf.attrs.get("DEFAULT_SECURITY").map(String::as_str) == Some("OFF") {
          return Ok(conf);
        }
      }
    } else {
      let plat_id = format!("00{}", platform_id.get(2..).unwrap_or(""));
      for conf in &self.configs {
        let (Some(conf_plat), Some(hash_hex)) = (conf.attrs.get("PLATFORM_ID"), conf.attrs.get("PLF_ROOT_HASH"))
        else {
          continue;
        };
        let conf_hash = hex::decode(hash_hex)
          .map_err(|_| Error::parse(self.origin.as_str(), format!("bad PLF_ROOT_HASH in config {:?}", conf.name)))?;
        if *conf_plat == plat_id && conf_hash == root_key_hash {
          return Ok(conf);
        }
      }
    }

    Err(Error::parse(self.origin.as_str(), "no matching boot_delivery for this device"))
  }
}

fn parse_config(conf: &Node, origin: &str) -> Result<BootConfig> {
  let mut config = BootConfig {
    name: attr(conf, "NAME", origin)?.to_string(),
    boot_config: vec![],
    boot_images: vec![],
    attrs: HashMap::new(),
    hwconf: None,
    keystore: None,
    sec_prop: None,
    sec_state: None,
  };

  for block in children(conf, "BOOT_CONFIG") {
    for file in children(block, "FILE") {
      config.boot_config.push(attr(file, "PATH", origin)?.to_string());
    }
  }
  for block in children(conf, "BOOT_IMAGES") {
    for file in children(block, "FILE") {
      config.boot_images.push(attr(file, "PATH", origin)?.to_string());
    }
  }
  for block in children(conf, "ATTRIBUTES") {
    config.attrs.extend(parse_attr_block(attr(block, "VALUE", origin)?));
  }
  if let Some(block) = children(conf, "HWCONFIG").first() {
    config.hwconf = Some(HwConfig {
      cert: attr(block, "CERTIFICATE", origin)?.to_string(),
      rev: attr(block, "REVISION", origin)?.to_string(),
      ver: attr(block, "VERSION", origin)?.to_string(),
    });
  }
  if let Some(block) = children(conf, "KEYSTORE").first() {
    config.keystore = Some(Keystore {
      cert: attr(block, "CERTIFICATE", origin)?.to_string(),
      rev: attr(block, "REVISION", origin)?.to_string(),
    });
  }
  if let Some(block) = children(conf, "SECURITY_PROPERTIES").first() {
    config.sec_prop = Some(SecurityProperties {
      rev: attr(block, "REVISION", origin)?.to_string(),
    });
  }
  if let Some(block) = children(conf, "SECURITY_STATE").first() {
    config.sec_state = Some(attr(block, "VALUE", origin)?.to_string());
  }

  Ok(config)
}

// semicolon-separated name=value pairs; values may carry one pair of
// surrounding double quotes
fn parse_attr_block(value: &str) -> HashMap<String, String> {
  let mut attrs = HashMap::new();
  for pair in value.split(';') {
    let Some((name, value)) = pair.split_once('=') else { continue };
    attrs.insert(name.trim().to_string(), strip_quotes(value.trim()).to_string());
  }
  attrs
}

fn strip_quotes(value: &str) -> &str {
  value
    .strip_prefix('"')
    .and_then(|v| v.strip_suffix('"'))
    .unwrap_or(value)
}

/// Resolve the list of partition SIN files under `<pdir>`.
///
/// Prefers `partition_delivery.xml`; a missing or empty manifest degrades
/// to a `*.sin` directory scan.
pub fn load_partition_delivery(pdir: &Path) -> Result<Vec<PathBuf>> {
  let manifest = pdir.join("partition_delivery.xml");

  let mut images = vec![];
  if manifest.is_file() {
    let origin = manifest.display().to_string();
    let text = std::fs::read_to_string(&manifest)?;
    for rel in parse_partition_delivery(&text, &origin)? {
      let path = pdir.join(&rel);
      if !path.is_file() {
        return Err(Error::parse(origin.as_str(), format!("file {:?} not found", path)));
      }
      images.push(path);
    }
  } else {
    tracing::warn!("file {:?} not found", manifest);
  }

  if images.is_empty() {
    images = scan_sin_dir(pdir)?;
  }
  Ok(images)
}

pub fn parse_partition_delivery(text: &str, origin: &str) -> Result<Vec<String>> {
  let doc = parse_xml(text, origin)?;
  let root = document_root(&doc, "PARTITION_DELIVERY", origin)?;

  let format = attr(root, "FORMAT", origin)?;
  if format != "1" {
    return Err(Error::parse(origin, format!("incorrect format {:?}, expected \"1\"", format)));
  }

  let mut images = vec![];
  for block in children(root, "PARTITION_IMAGES") {
    for file in children(block, "FILE") {
      let path = attr(file, "PATH", origin)?;
      if path.len() > 1 {
        images.push(path.to_string());
      }
    }
  }
  Ok(images)
}

fn scan_sin_dir(dir: &Path) -> Result<Vec<PathBuf>> {
  let mut images = vec![];
  for entry in std::fs::read_dir(dir)? {
    let path = entry?.path();
    if path.is_file() && path.extension().map(|e| e == "sin").unwrap_or(false) {
      images.push(path);
    }
  }
  images.sort();
  Ok(images)
}

/// Erase-policy labels from `update.xml`.
///
/// Only the `NOERASE` label is consulted during flashing: files carrying
/// it are skipped unless the user asked to erase user data.
#[derive(Debug, Default)]
pub struct UpdatePolicy {
  noerase: HashSet<String>,
}

impl UpdatePolicy {
  /// Parse `<wdir>/update.xml`; a missing file yields an empty policy.
  pub fn load(wdir: &Path) -> Result<Self> {
    let path = wdir.join("update.xml");
    if !path.is_file() {
      tracing::warn!("file {:?} not found, no erase policy applied", path);
      return Ok(UpdatePolicy::default());
    }
    let text = std::fs::read_to_string(&path)?;
    Self::parse(&text, &path.display().to_string())
  }

  pub fn parse(text: &str, origin: &str) -> Result<Self> {
    let doc = parse_xml(text, origin)?;
    let root = document_root(&doc, "UPDATE", origin)?;

    let mut noerase = HashSet::new();
    for node in children(root, "NOERASE") {
      let name = node.content.trim();
      if !name.is_empty() {
        noerase.insert(name.to_string());
      }
    }
    Ok(UpdatePolicy { noerase })
  }

  pub fn is_noerase(&self, filename: &str) -> bool {
    self.noerase.contains(filename)
  }
}

fn parse_xml(text: &str, origin: &str) -> Result<Node> {
  simple_xml::from_string(text.trim()).map_err(|_| Error::parse(origin, "malformed XML"))
}

// tolerate both parser shapes: the root element itself, or a document
// node wrapping it
fn document_root<'a>(doc: &'a Node, expected: &str, origin: &str) -> Result<&'a Node> {
  if doc.tag == expected {
    return Ok(doc);
  }
  if let Some(node) = doc.get_nodes(expected).and_then(|nodes| nodes.first()) {
    return Ok(node);
  }
  Err(Error::parse(origin, format!("incorrect XML root, expected {:?}", expected)))
}

fn children<'a>(node: &'a Node, tag: &str) -> &'a [Node] {
  node.get_nodes(tag).map(|nodes| nodes.as_slice()).unwrap_or(&[])
}

fn attr<'a>(node: &'a Node, name: &str, origin: &str) -> Result<&'a str> {
  node
    .get_attribute(name)
    .map(|value| {
      let value: &str = value;
      value
    })
    .ok_or_else(|| Error::parse(origin, format!("missing attribute {:?}", name)))
}
