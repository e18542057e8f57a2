//! Everything that reads or writes the APK container and the formats inside it.
use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use ::zip::ZipArchive;

pub mod align;
pub mod assemble;
pub mod axml;
pub mod extract;
pub mod icon;
pub mod info;
pub mod keystore;
pub mod manifest;
pub mod res;
pub mod sign;
pub mod strings;
pub mod table;

pub const MANIFEST_NAME: &str = "AndroidManifest.xml";
pub const RESOURCES_NAME: &str = "resources.arsc";

/// Locations of the central directory and its end record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZipInfo {
    pub cde_start: u64,
    pub cd_start: u64,
    pub cd_size: u64,
    pub entry_count: u16,
}

impl ZipInfo {
    pub fn new<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let cde_start = find_cde_start_pos(r)?;
        r.seek(SeekFrom::Start(cde_start + 10))?;
        let entry_count = r.read_u16::<LittleEndian>()?;
        let cd_size = r.read_u32::<LittleEndian>()? as u64;
        let cd_start = r.read_u32::<LittleEndian>()? as u64;
        anyhow::ensure!(
            entry_count != u16::MAX && cd_start != u32::MAX as u64 && cd_size != u32::MAX as u64,
            "zip64 archives are not supported"
        );
        anyhow::ensure!(
            cd_start + cd_size <= cde_start,
            "central directory overlaps its end record"
        );
        Ok(Self {
            cde_start,
            cd_start,
            cd_size,
            entry_count,
        })
    }
}

pub fn find_cde_start_pos<R: Read + Seek>(reader: &mut R) -> Result<u64> {
    const CENTRAL_DIRECTORY_END_SIGNATURE: u32 = 0x06054b50;
    const HEADER_SIZE: u64 = 22;
    let file_length = reader.seek(SeekFrom::End(0))?;
    let search_upper_bound = file_length.saturating_sub(HEADER_SIZE + u16::MAX as u64);
    anyhow::ensure!(file_length >= HEADER_SIZE, "Invalid zip header");
    let mut pos = file_length - HEADER_SIZE;
    while pos >= search_upper_bound {
        reader.seek(SeekFrom::Start(pos))?;
        if reader.read_u32::<LittleEndian>()? == CENTRAL_DIRECTORY_END_SIGNATURE {
            return Ok(pos);
        }
        pos = match pos.checked_sub(1) {
            Some(p) => p,
            None => break,
        };
    }
    anyhow::bail!("Could not find central directory end");
}

/// Reads a single entry out of an archive without unpacking the rest.
pub fn extract_zip_file(archive: &Path, name: &str) -> Result<Vec<u8>> {
    let file = File::open(archive)
        .with_context(|| format!("While opening `{}`", archive.display()))?;
    let mut archive = ZipArchive::new(file)?;
    let mut f = archive.by_name(name)?;
    let mut buf = Vec::with_capacity(f.size() as usize);
    f.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Like [`extract_zip_file`], but a missing entry is `None`.
pub fn extract_optional_zip_file(archive: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let file = File::open(archive)
        .with_context(|| format!("While opening `{}`", archive.display()))?;
    let mut archive = ZipArchive::new(file)?;
    let mut f = match archive.by_name(name) {
        Ok(f) => f,
        Err(::zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut buf = Vec::with_capacity(f.size() as usize);
    f.read_to_end(&mut buf)?;
    Ok(Some(buf))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_locate_the_central_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        testutil::write_apk(
            &path,
            &[("a.txt", b"hello".to_vec()), ("b/c.txt", b"world".to_vec())],
        );
        let info = ZipInfo::new(&mut File::open(&path).unwrap()).unwrap();
        assert_eq!(info.entry_count, 2);
        assert!(info.cd_start < info.cde_start);
        assert_eq!(info.cd_start + info.cd_size, info.cde_start);
        assert_eq!(extract_zip_file(&path, "b/c.txt").unwrap(), b"world");
        assert!(extract_optional_zip_file(&path, "missing").unwrap().is_none());
    }

    #[test]
    fn should_reject_files_without_an_end_record() {
        let mut cursor = std::io::Cursor::new(vec![0u8; 64]);
        assert!(find_cde_start_pos(&mut cursor).is_err());
    }
}
