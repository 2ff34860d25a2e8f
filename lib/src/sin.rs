//! SIN archive handling.
//!
//! A SIN file is a gzip-or-plain POSIX ustar archive whose first regular
//! member is a CMS signature blob and whose remaining members are image
//! chunks sharing the CMS stem. The device verifies the CMS before it
//! accepts any chunk, so dispatch order matters.

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::protocol::latin1;
use crate::{Engine, Error, Result, Transport};

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const CMS_MAGIC: [u8; 2] = [0x30, 0x82];
const USTAR_MAGIC_OFFSET: usize = 257;
const TAR_BLOCK: usize = 512;

/// Discover the image name of a SIN archive without unpacking it: the
/// stem of the first tar entry, read from the leading 512-byte header.
pub fn sin_image_name(path: &Path) -> Result<String> {
  let origin = path.display().to_string();
  let size = std::fs::metadata(path)?.len() as usize;
  if size < 64 {
    return Err(Error::parse(origin, format!("{} bytes is too small for a SIN archive", size)));
  }

  let mut file = File::open(path)?;
  let mut head = vec![0u8; TAR_BLOCK.min(size)];
  file.read_exact(&mut head)?;

  let block = if head[..2] == GZIP_MAGIC {
    file.seek(SeekFrom::Start(0))?;
    let mut gz = GzDecoder::new(BufReader::new(file));
    let mut buf = vec![0u8; TAR_BLOCK];
    gz.read_exact(&mut buf)
      .map_err(|_| Error::parse(origin.as_str(), "truncated gzip stream"))?;
    buf
  } else {
    head
  };

  if block.len() < TAR_BLOCK {
    return Err(Error::parse(origin, "truncated tar header"));
  }
  if &block[USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + 6] != b"ustar\0" {
    return Err(Error::parse(origin, "not a ustar archive"));
  }

  let name_field = latin1(&block[..100]);
  let first_name = name_field.split('\0').next().unwrap_or("");
  if first_name.is_empty() || first_name.starts_with('.') {
    return Err(Error::parse(origin, format!("unusable first entry name {:?}", first_name)));
  }

  Ok(stem(first_name).to_string())
}

/// Flash target for an image, suffixed with the active slot when the
/// loader reports one. A `_other` SIN targets the opposite slot.
pub fn slot_target(imgname: &str, sin_filename: &str, has_slot: bool, current_slot: Option<&str>) -> String {
  let slot = match current_slot {
    Some(slot) if has_slot => slot,
    _ => return imgname.to_string(),
  };
  let slot = if sin_filename.contains("_other") {
    if slot == "a" {
      "b"
    } else {
      "a"
    }
  } else {
    slot
  };
  format!("{}_{}", imgname, slot)
}

/// Stream a SIN archive to the device.
///
/// The CMS member is uploaded first (`signature:<size>` when supported,
/// otherwise `download:` plus a bare `signature`). Each image chunk is
/// then downloaded and committed with `<aux_cmd>:<target>`; the first
/// chunk of a `flash` dispatch erases the target beforehand.
///
/// Test levels mirror the driver program: `>= 100` validates the archive
/// without touching the device (`engine` may be `None`), `1..100` uploads
/// payloads but skips erase/flash/Repartition, `0` runs everything.
pub fn dispatch_sin<T: Transport>(
  mut engine: Option<&mut Engine<T>>,
  path: &Path,
  aux_cmd: &str,
  current_slot: Option<&str>,
  test: u32,
) -> Result<()> {
  let sinfn = path
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_default();
  let sinsize = std::fs::metadata(path)?.len();
  if sinsize < 512 {
    return Err(Error::parse(
      path.display().to_string(),
      format!("incorrect SIN file size: {} bytes", sinsize),
    ));
  }
  if engine.is_none() && test < 100 {
    return Err(Error::State("cannot dispatch a SIN without a connected device".into()));
  }

  let mut reader = BufReader::new(File::open(path)?);
  let mut magic = [0u8; 2];
  reader.read_exact(&mut magic)?;
  reader.seek(SeekFrom::Start(0))?;
  let stream: Box<dyn Read> = if magic == GZIP_MAGIC {
    Box::new(GzDecoder::new(reader))
  } else {
    Box::new(reader)
  };
  let mut archive = tar::Archive::new(stream);

  tracing::debug!("unpacking file {:?} ...", sinfn);
  let mut imgname: Option<String> = None;
  let mut has_slot = false;
  let mut num: i64 = -2;

  for entry in archive.entries()? {
    let mut entry = entry?;
    if !entry.header().entry_type().is_file() {
      continue;
    }
    let fname = entry.path()?.to_string_lossy().to_string();
    let cname = format!("{}/{}", sinfn, fname);

    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;

    if let Some(engine) = engine.as_deref_mut() {
      if engine.max_download_size > 0 && data.len() >= engine.max_download_size {
        return Err(Error::proto(format!(
          "chunk {:?} is too large: {} bytes, max {}",
          cname,
          data.len(),
          engine.max_download_size
        )));
      }
    }
    if data.is_empty() {
      return Err(Error::parse(cname, "chunk is empty"));
    }

    if test >= 100 {
      tracing::info!("  skip sin chunk {:?}, size: {} (test = {})", cname, data.len(), test);
      continue;
    }
    let Some(engine) = engine.as_deref_mut() else {
      return Err(Error::State("cannot dispatch a SIN without a connected device".into()));
    };

    num += 1;
    if num == -1 {
      // the leading CMS blob
      if !fname.ends_with(".cms") {
        return Err(Error::parse(cname, "incorrect CMS (extension)"));
      }
      if data.len() < 2 || data[..2] != CMS_MAGIC {
        return Err(Error::parse(cname, "incorrect CMS (magic)"));
      }
      imgname = Some(stem(&fname).to_string());

      tracing::info!("uploading signature {:?} (size: {})", cname, data.len());
      if engine.sign_with_data {
        engine.upload_signature(&data)?;
      } else {
        engine.download(&data)?;
        engine.command("signature")?;
      }
      tracing::info!("  signature: OKAY");
      continue;
    }

    let img = imgname
      .clone()
      .ok_or_else(|| Error::proto("image chunk before the CMS member"))?;
    if stem(&fname) != img {
      return Err(Error::parse(
        cname,
        format!("chunk name does not match image {:?}", img),
      ));
    }

    if num == 0 && aux_cmd == "flash" {
      if matches!(current_slot, Some("a") | Some("b")) {
        let answer = engine.getvar(&format!("has-slot:{}", img))?;
        has_slot = answer == "yes";
        if has_slot {
          tracing::info!("partition {:?} has slot {:?}", img, current_slot.unwrap_or(""));
        }
      }
      let erase_cmd = format!("erase:{}", slot_target(&img, &sinfn, has_slot, current_slot));
      tracing::info!("CMD: {}", erase_cmd);
      if test > 0 {
        tracing::info!("  skip erase (test = {})", test);
      } else {
        engine.command(&erase_cmd)?;
      }
    }

    tracing::info!("uploading chunk {:?} (size: {})", cname, data.len());
    engine.download(&data)?;

    let cmd = if aux_cmd == "Repartition" && img.starts_with("partitionimage_") {
      // Oreo renamed the partition images to partitionimage_<lun>
      format!("Repartition:{}", img.trim_start_matches("partitionimage_"))
    } else {
      format!("{}:{}", aux_cmd, slot_target(&img, &sinfn, has_slot, current_slot))
    };
    tracing::info!("CMD: {}", cmd);
    if test > 0 {
      tracing::info!("  skip {} (test = {})", aux_cmd, test);
    } else {
      engine.command(&cmd)?;
    }
  }

  Ok(())
}

fn stem(name: &str) -> &str {
  name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}
