//! Rebuilds a container from a working tree.
use super::{MANIFEST_NAME, RESOURCES_NAME};
use crate::core::error::PipelineError;
use crate::core::workspace::CancelToken;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// One entry of a reassembled container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ZipEntryDescriptor {
    pub name: String,
    pub source: PathBuf,
    pub compression: CompressionMethod,
    /// Size and CRC32 of stored entries, computed before writing.
    pub size: Option<u64>,
    pub crc32: Option<u32>,
}

/// Entries the platform reads in place are stored, everything else deflated.
pub fn compression_for(name: &str) -> CompressionMethod {
    let stored = match name {
        MANIFEST_NAME | RESOURCES_NAME | "META-INF/MANIFEST.MF" => true,
        _ if name.ends_with(".dex") => true,
        _ if name.starts_with("META-INF/") => {
            name.ends_with(".SF") || name.ends_with(".RSA") || name.ends_with(".DSA")
        }
        _ => false,
    };
    if stored {
        CompressionMethod::Stored
    } else {
        CompressionMethod::Deflated
    }
}

/// Files under `META-INF/` that belong to a v1 JAR signature.
pub fn is_v1_signature_file(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    !file.contains('/')
        && (file == "MANIFEST.MF"
            || [".SF", ".RSA", ".DSA", ".EC"]
                .iter()
                .any(|ext| file.ends_with(ext)))
}

/// Deletes v1 signature files from `working_dir` and returns their entry
/// names. An emptied `META-INF` goes too.
pub fn remove_v1_signature(working_dir: &Path) -> Result<Vec<String>, PipelineError> {
    let meta_inf = working_dir.join("META-INF");
    if !meta_inf.is_dir() {
        return Ok(vec![]);
    }
    let mut entries = fs::read_dir(&meta_inf)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    let mut removed = vec![];
    for entry in entries {
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let name = format!("META-INF/{}", file_name);
        if entry.file_type()?.is_file() && is_v1_signature_file(&name) {
            fs::remove_file(entry.path())?;
            log::debug!("Removed stale {}", name);
            removed.push(name);
        }
    }
    if fs::read_dir(&meta_inf)?.next().is_none() {
        fs::remove_dir(&meta_inf)?;
    }
    Ok(removed)
}

/// Copies `r` into `w`. When `expected` size and CRC32 are given, the copied
/// bytes must match them.
fn copy_checked<R: Read, W: Write>(
    r: &mut R,
    w: &mut W,
    expected: Option<(u64, u32)>,
) -> Result<u64> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        w.write_all(&buf[..n])?;
        copied += n as u64;
    }
    if let Some((size, crc32)) = expected {
        let actual = hasher.finalize();
        anyhow::ensure!(
            copied == size && actual == crc32,
            "expected {} bytes with CRC32 {:08x}, packed {} bytes with CRC32 {:08x}",
            size,
            crc32,
            copied,
            actual
        );
    }
    Ok(copied)
}

fn crc32_of(path: &Path) -> Result<(u64, u32)> {
    let mut f = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0;
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hasher.finalize()))
}

struct Zip<W: Write + Seek> {
    zip: ZipWriter<W>,
    entries: Vec<ZipEntryDescriptor>,
}

impl<W: Write + Seek> Zip<W> {
    fn options(method: CompressionMethod) -> FileOptions {
        FileOptions::default()
            .compression_method(method)
            .last_modified_time(DateTime::default())
            .unix_permissions(0o644)
    }

    fn add_file(&mut self, source: &Path, name: String) -> Result<()> {
        let compression = compression_for(&name);
        let (size, crc32) = if compression == CompressionMethod::Stored {
            let (size, crc32) = crc32_of(source)?;
            (Some(size), Some(crc32))
        } else {
            (None, None)
        };
        let mut f = File::open(source)
            .with_context(|| format!("While opening file `{}`", source.display()))?;
        self.zip.start_file(name.as_str(), Self::options(compression))?;
        let expected = size.zip(crc32);
        copy_checked(&mut f, &mut self.zip, expected)
            .with_context(|| format!("`{}` changed while being packed", name))?;
        log::debug!("Packed {} ({:?})", name, compression);
        self.entries.push(ZipEntryDescriptor {
            name,
            source: source.to_path_buf(),
            compression,
            size,
            crc32,
        });
        Ok(())
    }

    fn add_directory(&mut self, source: &Path, name: String) -> Result<()> {
        self.zip
            .add_directory(name.as_str(), Self::options(CompressionMethod::Stored))?;
        self.entries.push(ZipEntryDescriptor {
            name: format!("{}/", name),
            source: source.to_path_buf(),
            compression: CompressionMethod::Stored,
            size: Some(0),
            crc32: Some(0),
        });
        Ok(())
    }
}

fn entry_name(prefix: &str, file_name: &str) -> String {
    if prefix.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", prefix, file_name)
    }
}

fn add_recursive<W: Write + Seek>(
    zip: &mut Zip<W>,
    source: &Path,
    prefix: &str,
    cancel: &CancelToken,
) -> Result<(), PipelineError> {
    let mut entries = fs::read_dir(source)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        cancel.check()?;
        let file_name = entry.file_name();
        let file_name = file_name.to_str().ok_or_else(|| {
            PipelineError::Container(format!("non UTF-8 file name {:?}", entry.file_name()))
        })?;
        let source = entry.path();
        let name = entry_name(prefix, file_name);
        let file_type = entry.file_type()?;
        let result = if file_type.is_dir() {
            if fs::read_dir(&source)?.next().is_none() {
                zip.add_directory(&source, name)
            } else {
                add_recursive(zip, &source, &name, cancel)?;
                Ok(())
            }
        } else if file_type.is_file() {
            zip.add_file(&source, name)
        } else {
            log::warn!("Skipping special file {}", source.display());
            Ok(())
        };
        result.map_err(|e| PipelineError::Container(format!("{:#}", e)))?;
    }
    Ok(())
}

/// Packs `working_dir` into `out`, depth first with siblings sorted by name.
pub fn reassemble<W: Write + Seek>(
    working_dir: &Path,
    out: W,
    cancel: &CancelToken,
) -> Result<Vec<ZipEntryDescriptor>, PipelineError> {
    if !working_dir.is_dir() {
        return Err(PipelineError::Container(format!(
            "{} is not a directory",
            working_dir.display()
        )));
    }
    let mut zip = Zip {
        zip: ZipWriter::new(out),
        entries: vec![],
    };
    add_recursive(&mut zip, working_dir, "", cancel)?;
    zip.zip
        .finish()
        .map_err(|e| PipelineError::Container(e.to_string()))?;
    log::info!(
        "Packed {} entries from {}",
        zip.entries.len(),
        working_dir.display()
    );
    Ok(zip.entries)
}
