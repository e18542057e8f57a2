//! Entry alignment, rewriting local headers so data lands on fixed boundaries.
use super::ZipInfo;
use crate::core::config::AlignConfig;
use crate::core::error::PipelineError;
use crate::core::workspace::CancelToken;
use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use zip::ZipArchive;

const LOCAL_HEADER_SIGNATURE: u32 = 0x04034b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x02014b50;
const LOCAL_HEADER_SIZE: u64 = 30;
const CENTRAL_HEADER_SIZE: usize = 46;
const DATA_DESCRIPTOR_FLAG: u16 = 1 << 3;
/// Extra field id zipalign and apksigner use for padding.
const ALIGNMENT_EXTRA_ID: u16 = 0xd935;
const ALIGNMENT_EXTRA_SIZE: u64 = 6;

/// A central directory record, with the fields the rewrite needs split out.
struct CentralRecord {
    flags: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    local_offset: u32,
    name: Vec<u8>,
    /// The whole record as read.
    raw: Vec<u8>,
}

impl CentralRecord {
    fn read<R: Read>(r: &mut R) -> Result<Self> {
        let mut fixed = [0u8; CENTRAL_HEADER_SIZE];
        r.read_exact(&mut fixed)?;
        let mut c = Cursor::new(&fixed[..]);
        anyhow::ensure!(
            c.read_u32::<LittleEndian>()? == CENTRAL_HEADER_SIGNATURE,
            "bad central directory signature"
        );
        c.seek(SeekFrom::Start(8))?;
        let flags = c.read_u16::<LittleEndian>()?;
        c.seek(SeekFrom::Start(16))?;
        let crc32 = c.read_u32::<LittleEndian>()?;
        let compressed_size = c.read_u32::<LittleEndian>()?;
        let uncompressed_size = c.read_u32::<LittleEndian>()?;
        let name_len = c.read_u16::<LittleEndian>()? as usize;
        let extra_len = c.read_u16::<LittleEndian>()? as usize;
        let comment_len = c.read_u16::<LittleEndian>()? as usize;
        c.seek(SeekFrom::Start(42))?;
        let local_offset = c.read_u32::<LittleEndian>()?;
        anyhow::ensure!(
            compressed_size != u32::MAX && uncompressed_size != u32::MAX && local_offset != u32::MAX,
            "zip64 entries are not supported"
        );

        let mut variable = vec![0u8; name_len + extra_len + comment_len];
        r.read_exact(&mut variable)?;
        let name = variable[..name_len].to_vec();
        let mut raw = fixed.to_vec();
        raw.extend_from_slice(&variable);
        Ok(Self {
            flags,
            crc32,
            compressed_size,
            uncompressed_size,
            local_offset,
            name,
            raw,
        })
    }

    fn name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// The record pointing at `local_offset`, without the data descriptor flag.
    fn write<W: Write>(&self, w: &mut W, local_offset: u32) -> Result<()> {
        let mut raw = self.raw.clone();
        let mut c = Cursor::new(&mut raw);
        c.seek(SeekFrom::Start(8))?;
        c.write_u16::<LittleEndian>(self.flags & !DATA_DESCRIPTOR_FLAG)?;
        c.seek(SeekFrom::Start(42))?;
        c.write_u32::<LittleEndian>(local_offset)?;
        w.write_all(&raw)?;
        Ok(())
    }
}

/// Extra fields other than an old alignment record. A malformed extra block
/// is dropped entirely.
fn kept_extras(extra: &[u8]) -> Vec<u8> {
    let mut kept = vec![];
    let mut c = Cursor::new(extra);
    while (c.position() as usize) < extra.len() {
        let start = c.position() as usize;
        let (Ok(id), Ok(len)) = (c.read_u16::<LittleEndian>(), c.read_u16::<LittleEndian>()) else {
            return vec![];
        };
        let end = start + 4 + len as usize;
        if end > extra.len() {
            return vec![];
        }
        if id != ALIGNMENT_EXTRA_ID {
            kept.extend_from_slice(&extra[start..end]);
        }
        c.set_position(end as u64);
    }
    kept
}

fn alignment_for(name: &str, config: &AlignConfig) -> u64 {
    if name.ends_with(".so") {
        config.native_lib_alignment
    } else {
        config.alignment
    }
}

fn padding(header_end: u64, alignment: u64) -> u64 {
    (alignment - (header_end + ALIGNMENT_EXTRA_SIZE) % alignment) % alignment
}

fn align_entries<W: Write>(
    apk: &[u8],
    w: &mut W,
    config: &AlignConfig,
    cancel: &CancelToken,
) -> Result<(), PipelineError> {
    let fail = |e: anyhow::Error| PipelineError::Alignment(format!("{:#}", e));
    if config.alignment == 0 || config.native_lib_alignment == 0 {
        return Err(PipelineError::Alignment("alignment must be positive".to_string()));
    }
    let mut r = Cursor::new(apk);
    let info = ZipInfo::new(&mut r).map_err(fail)?;
    r.seek(SeekFrom::Start(info.cd_start))?;
    let mut records = vec![];
    for _ in 0..info.entry_count {
        records.push(CentralRecord::read(&mut r).map_err(fail)?);
    }

    let mut pos: u64 = 0;
    let mut offsets = vec![];
    for record in &records {
        cancel.check()?;
        let name = record.name();
        let (header, data) = local_entry(apk, record)
            .with_context(|| format!("entry `{}`", name))
            .map_err(fail)?;
        let alignment = alignment_for(&name, config);
        let kept = kept_extras(header.extra);
        let header_end = pos + LOCAL_HEADER_SIZE + record.name.len() as u64 + kept.len() as u64;
        let pad = padding(header_end, alignment);
        let extra_len = kept.len() as u64 + ALIGNMENT_EXTRA_SIZE + pad;
        if extra_len > u16::MAX as u64 {
            return Err(PipelineError::Alignment(format!(
                "alignment {} for `{}` does not fit in the extra field",
                alignment, name
            )));
        }

        let mut out = Vec::with_capacity((LOCAL_HEADER_SIZE + extra_len) as usize);
        out.write_u32::<LittleEndian>(LOCAL_HEADER_SIGNATURE)?;
        out.write_u16::<LittleEndian>(header.version)?;
        out.write_u16::<LittleEndian>(header.flags & !DATA_DESCRIPTOR_FLAG)?;
        out.write_u16::<LittleEndian>(header.method)?;
        out.write_u16::<LittleEndian>(header.time)?;
        out.write_u16::<LittleEndian>(header.date)?;
        out.write_u32::<LittleEndian>(record.crc32)?;
        out.write_u32::<LittleEndian>(record.compressed_size)?;
        out.write_u32::<LittleEndian>(record.uncompressed_size)?;
        out.write_u16::<LittleEndian>(record.name.len() as u16)?;
        out.write_u16::<LittleEndian>(extra_len as u16)?;
        out.write_all(&record.name)?;
        out.write_all(&kept)?;
        out.write_u16::<LittleEndian>(ALIGNMENT_EXTRA_ID)?;
        out.write_u16::<LittleEndian>((ALIGNMENT_EXTRA_SIZE - 4 + pad) as u16)?;
        out.write_u16::<LittleEndian>(alignment.min(u16::MAX as u64) as u16)?;
        out.resize(out.len() + pad as usize, 0);
        w.write_all(&out)?;
        w.write_all(data)?;

        let offset = u32::try_from(pos)
            .map_err(|_| PipelineError::Alignment("output exceeds 4 GiB".to_string()))?;
        offsets.push(offset);
        log::trace!("{} at {} aligned to {}", name, pos + out.len() as u64, alignment);
        pos += out.len() as u64 + data.len() as u64;
    }

    let cd_start = pos;
    let mut cd = vec![];
    for (record, offset) in records.iter().zip(offsets) {
        record.write(&mut cd, offset).map_err(fail)?;
    }
    w.write_all(&cd)?;

    let mut eocd = apk[info.cde_start as usize..].to_vec();
    let mut c = Cursor::new(&mut eocd);
    c.seek(SeekFrom::Start(12))?;
    c.write_u32::<LittleEndian>(cd.len() as u32)?;
    c.write_u32::<LittleEndian>(
        u32::try_from(cd_start)
            .map_err(|_| PipelineError::Alignment("output exceeds 4 GiB".to_string()))?,
    )?;
    w.write_all(&eocd)?;
    Ok(())
}

struct LocalHeader<'a> {
    version: u16,
    flags: u16,
    method: u16,
    time: u16,
    date: u16,
    extra: &'a [u8],
}

/// The local header fields and the entry data it is followed by.
fn local_entry<'a>(apk: &'a [u8], record: &CentralRecord) -> Result<(LocalHeader<'a>, &'a [u8])> {
    let start = record.local_offset as usize;
    let fixed = apk
        .get(start..start + LOCAL_HEADER_SIZE as usize)
        .context("local header out of bounds")?;
    let mut c = Cursor::new(fixed);
    anyhow::ensure!(
        c.read_u32::<LittleEndian>()? == LOCAL_HEADER_SIGNATURE,
        "bad local header signature"
    );
    let version = c.read_u16::<LittleEndian>()?;
    let flags = c.read_u16::<LittleEndian>()?;
    let method = c.read_u16::<LittleEndian>()?;
    let time = c.read_u16::<LittleEndian>()?;
    let date = c.read_u16::<LittleEndian>()?;
    c.seek(SeekFrom::Current(12))?;
    let name_len = c.read_u16::<LittleEndian>()? as usize;
    let extra_len = c.read_u16::<LittleEndian>()? as usize;
    let extra_start = start + LOCAL_HEADER_SIZE as usize + name_len;
    let data_start = extra_start + extra_len;
    let data_end = data_start + record.compressed_size as usize;
    let extra = apk
        .get(extra_start..data_start)
        .context("local extra field out of bounds")?;
    let data = apk.get(data_start..data_end).context("entry data out of bounds")?;
    Ok((
        LocalHeader {
            version,
            flags,
            method,
            time,
            date,
            extra,
        },
        data,
    ))
}

/// Writes an aligned copy of `input` to `output`.
pub fn align_file(
    input: &Path,
    output: &Path,
    config: &AlignConfig,
    cancel: &CancelToken,
) -> Result<(), PipelineError> {
    let apk = std::fs::read(input)
        .map_err(|e| PipelineError::Alignment(format!("cannot read {}: {}", input.display(), e)))?;
    let dir = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut w = std::io::BufWriter::new(tmp.as_file_mut());
        align_entries(&apk, &mut w, config, cancel)?;
        w.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(output)
        .map_err(|e| PipelineError::Alignment(format!("cannot write {}: {}", output.display(), e)))?;
    log::info!("Aligned {} -> {}", input.display(), output.display());
    Ok(())
}

/// Names of entries whose data does not sit on its required boundary.
pub fn verify_alignment(path: &Path, config: &AlignConfig) -> Result<Vec<String>> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut misaligned = vec![];
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.data_start() % alignment_for(entry.name(), config) != 0 {
            misaligned.push(entry.name().to_string());
        }
    }
    Ok(misaligned)
}
