//! Binary resource chunks shared by compiled XML documents and `resources.arsc`.
use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ChunkType {
    Null = 0x0000,
    StringPool = 0x0001,
    Table = 0x0002,
    Xml = 0x0003,
    XmlStartNamespace = 0x0100,
    XmlEndNamespace = 0x0101,
    XmlStartElement = 0x0102,
    XmlEndElement = 0x0103,
    XmlCdata = 0x0104,
    XmlResourceMap = 0x0180,
    TablePackage = 0x0200,
    TableType = 0x0201,
    TableTypeSpec = 0x0202,
}

impl ChunkType {
    pub fn from_u16(ty: u16) -> Option<Self> {
        Some(match ty {
            ty if ty == ChunkType::Null as u16 => ChunkType::Null,
            ty if ty == ChunkType::StringPool as u16 => ChunkType::StringPool,
            ty if ty == ChunkType::Table as u16 => ChunkType::Table,
            ty if ty == ChunkType::Xml as u16 => ChunkType::Xml,
            ty if ty == ChunkType::XmlStartNamespace as u16 => ChunkType::XmlStartNamespace,
            ty if ty == ChunkType::XmlEndNamespace as u16 => ChunkType::XmlEndNamespace,
            ty if ty == ChunkType::XmlStartElement as u16 => ChunkType::XmlStartElement,
            ty if ty == ChunkType::XmlEndElement as u16 => ChunkType::XmlEndElement,
            ty if ty == ChunkType::XmlCdata as u16 => ChunkType::XmlCdata,
            ty if ty == ChunkType::XmlResourceMap as u16 => ChunkType::XmlResourceMap,
            ty if ty == ChunkType::TablePackage as u16 => ChunkType::TablePackage,
            ty if ty == ChunkType::TableType as u16 => ChunkType::TableType,
            ty if ty == ChunkType::TableTypeSpec as u16 => ChunkType::TableTypeSpec,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResChunkHeader {
    pub ty: u16,
    /// Bytes from the chunk start to its payload.
    pub header_size: u16,
    /// Bytes from the chunk start to the next chunk, children included.
    pub size: u32,
}

impl ResChunkHeader {
    pub const SIZE: u16 = 8;

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let ty = r.read_u16::<LittleEndian>()?;
        let header_size = r.read_u16::<LittleEndian>()?;
        let size = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            ty,
            header_size,
            size,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16::<LittleEndian>(self.ty)?;
        w.write_u16::<LittleEndian>(self.header_size)?;
        w.write_u32::<LittleEndian>(self.size)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResStringPoolHeader {
    pub string_count: u32,
    pub style_count: u32,
    pub flags: u32,
    pub strings_start: u32,
    pub styles_start: u32,
}

impl ResStringPoolHeader {
    pub const SORTED_FLAG: u32 = 1 << 0;
    pub const UTF8_FLAG: u32 = 1 << 8;

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let string_count = r.read_u32::<LittleEndian>()?;
        let style_count = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u32::<LittleEndian>()?;
        let strings_start = r.read_u32::<LittleEndian>()?;
        let styles_start = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            string_count,
            style_count,
            flags,
            strings_start,
            styles_start,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.string_count)?;
        w.write_u32::<LittleEndian>(self.style_count)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_u32::<LittleEndian>(self.strings_start)?;
        w.write_u32::<LittleEndian>(self.styles_start)?;
        Ok(())
    }

    pub fn is_utf8(&self) -> bool {
        self.flags & Self::UTF8_FLAG > 0
    }
}

/// Decoded string pool. `flags` keeps the original encoding so a rewrite
/// produces the same byte layout.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StringPool {
    pub strings: Vec<String>,
    pub styles: Vec<Vec<ResSpan>>,
    pub flags: u32,
}

impl StringPool {
    pub fn is_utf8(&self) -> bool {
        self.flags & ResStringPoolHeader::UTF8_FLAG > 0
    }

    pub fn get(&self, index: i32) -> Option<&str> {
        if index < 0 {
            return None;
        }
        self.strings.get(index as usize).map(String::as_str)
    }

    /// Parses the payload of a string pool chunk. `chunk` holds the whole
    /// chunk, header included.
    fn decode(chunk: &[u8], header: &ResChunkHeader) -> Result<Self> {
        let mut r = chunk
            .get(ResChunkHeader::SIZE as usize..)
            .context("truncated string pool")?;
        let pool_header = ResStringPoolHeader::read(&mut r)?;
        let mut r = chunk
            .get(header.header_size as usize..)
            .context("truncated string pool")?;
        let mut string_offsets = Vec::with_capacity(pool_header.string_count as usize);
        for _ in 0..pool_header.string_count {
            string_offsets.push(r.read_u32::<LittleEndian>()? as usize);
        }
        let mut style_offsets = Vec::with_capacity(pool_header.style_count as usize);
        for _ in 0..pool_header.style_count {
            style_offsets.push(r.read_u32::<LittleEndian>()? as usize);
        }

        let strings_start = pool_header.strings_start as usize;
        let mut strings = Vec::with_capacity(string_offsets.len());
        for offset in string_offsets {
            let pos = strings_start + offset;
            let s = if pool_header.is_utf8() {
                decode_utf8(chunk, pos)
            } else {
                decode_utf16(chunk, pos)
            }
            .with_context(|| format!("invalid string at offset {}", offset))?;
            strings.push(s);
        }

        let styles_start = pool_header.styles_start as usize;
        let mut styles = Vec::with_capacity(style_offsets.len());
        for offset in style_offsets {
            let mut r = chunk
                .get(styles_start + offset..)
                .with_context(|| format!("invalid style at offset {}", offset))?;
            let mut spans = vec![];
            while let Some(span) = ResSpan::read(&mut r)? {
                spans.push(span);
            }
            styles.push(spans);
        }

        Ok(Self {
            strings,
            styles,
            flags: pool_header.flags,
        })
    }

    fn encode(&self, w: &mut impl Write) -> Result<()> {
        let utf8 = self.is_utf8();
        let mut offsets = Vec::with_capacity(self.strings.len() + self.styles.len());
        let mut data = vec![];
        for s in &self.strings {
            offsets.push(data.len() as u32);
            if utf8 {
                encode_utf8(&mut data, s)?;
            } else {
                encode_utf16(&mut data, s)?;
            }
        }
        while data.len() % 4 != 0 {
            data.push(0);
        }

        let mut style_data = vec![];
        for style in &self.styles {
            offsets.push(style_data.len() as u32);
            for span in style {
                span.write(&mut style_data)?;
            }
            style_data.write_u32::<LittleEndian>(ResSpan::END)?;
        }
        if !self.styles.is_empty() {
            style_data.write_u32::<LittleEndian>(ResSpan::END)?;
            style_data.write_u32::<LittleEndian>(ResSpan::END)?;
        }

        let header_size = ResChunkHeader::SIZE as u32 + 20;
        let strings_start = header_size + 4 * offsets.len() as u32;
        let styles_start = if self.styles.is_empty() {
            0
        } else {
            strings_start + data.len() as u32
        };
        let size = strings_start + data.len() as u32 + style_data.len() as u32;

        ResChunkHeader {
            ty: ChunkType::StringPool as u16,
            header_size: header_size as u16,
            size,
        }
        .write(w)?;
        ResStringPoolHeader {
            string_count: self.strings.len() as u32,
            style_count: self.styles.len() as u32,
            flags: self.flags & !ResStringPoolHeader::SORTED_FLAG,
            strings_start,
            styles_start,
        }
        .write(w)?;
        for offset in offsets {
            w.write_u32::<LittleEndian>(offset)?;
        }
        w.write_all(&data)?;
        w.write_all(&style_data)?;
        Ok(())
    }
}

fn decode_utf8(chunk: &[u8], pos: usize) -> Result<String> {
    let (_utf16_len, pos) = read_len8(chunk, pos)?;
    let (len, pos) = read_len8(chunk, pos)?;
    let bytes = chunk.get(pos..pos + len).context("string out of bounds")?;
    Ok(match String::from_utf8(bytes.to_vec()) {
        Ok(s) => s,
        // Modified UTF-8 from older tools.
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    })
}

fn read_len8(chunk: &[u8], pos: usize) -> Result<(usize, usize)> {
    let first = *chunk.get(pos).context("string length out of bounds")? as usize;
    if first & 0x80 != 0 {
        let second = *chunk.get(pos + 1).context("string length out of bounds")? as usize;
        Ok((((first & 0x7f) << 8) | second, pos + 2))
    } else {
        Ok((first, pos + 1))
    }
}

fn decode_utf16(chunk: &[u8], pos: usize) -> Result<String> {
    let unit = |at: usize| -> Result<u16> {
        let bytes = chunk.get(at..at + 2).context("string out of bounds")?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    };
    let first = unit(pos)? as usize;
    let (len, mut pos) = if first & 0x8000 != 0 {
        (((first & 0x7fff) << 16) | unit(pos + 2)? as usize, pos + 4)
    } else {
        (first, pos + 2)
    };
    let mut units = Vec::with_capacity(len);
    for _ in 0..len {
        units.push(unit(pos)?);
        pos += 2;
    }
    Ok(String::from_utf16_lossy(&units))
}

fn encode_utf8(w: &mut Vec<u8>, s: &str) -> Result<()> {
    let utf16_len = s.encode_utf16().count();
    anyhow::ensure!(
        utf16_len <= 0x7fff && s.len() <= 0x7fff,
        "string too long for a UTF-8 pool"
    );
    for len in [utf16_len, s.len()] {
        if len > 0x7f {
            w.push(((len >> 8) as u8) | 0x80);
            w.push(len as u8);
        } else {
            w.push(len as u8);
        }
    }
    w.extend_from_slice(s.as_bytes());
    w.push(0);
    Ok(())
}

fn encode_utf16(w: &mut Vec<u8>, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    anyhow::ensure!(
        units.len() <= 0x7fff_ffff,
        "string too long for a UTF-16 pool"
    );
    if units.len() > 0x7fff {
        w.write_u16::<LittleEndian>(((units.len() >> 16) as u16) | 0x8000)?;
        w.write_u16::<LittleEndian>(units.len() as u16)?;
    } else {
        w.write_u16::<LittleEndian>(units.len() as u16)?;
    }
    for unit in units {
        w.write_u16::<LittleEndian>(unit)?;
    }
    w.write_u16::<LittleEndian>(0)?;
    Ok(())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResTableHeader {
    pub package_count: u32,
}

impl ResTableHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let package_count = r.read_u32::<LittleEndian>()?;
        Ok(Self { package_count })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.package_count)?;
        Ok(())
    }
}

/// Source position attached to every XML node chunk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlNodeHeader {
    pub line_number: u32,
    /// String pool index of a comment, -1 for none.
    pub comment: i32,
}

impl ResXmlNodeHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let line_number = r.read_u32::<LittleEndian>()?;
        let comment = r.read_i32::<LittleEndian>()?;
        Ok(Self {
            line_number,
            comment,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.line_number)?;
        w.write_i32::<LittleEndian>(self.comment)?;
        Ok(())
    }
}

impl Default for ResXmlNodeHeader {
    fn default() -> Self {
        Self {
            line_number: 1,
            comment: -1,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlNamespace {
    pub prefix: i32,
    pub uri: i32,
}

impl ResXmlNamespace {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let prefix = r.read_i32::<LittleEndian>()?;
        let uri = r.read_i32::<LittleEndian>()?;
        Ok(Self { prefix, uri })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.prefix)?;
        w.write_i32::<LittleEndian>(self.uri)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlStartElement {
    pub namespace: i32,
    pub name: i32,
    /// Offset from the start of this structure to the first attribute.
    pub attribute_start: u16,
    pub attribute_size: u16,
    pub attribute_count: u16,
    /// 1-based attribute indices, 0 when absent.
    pub id_index: u16,
    pub class_index: u16,
    pub style_index: u16,
}

impl Default for ResXmlStartElement {
    fn default() -> Self {
        Self {
            namespace: -1,
            name: -1,
            attribute_start: Self::SIZE,
            attribute_size: ResXmlAttribute::SIZE,
            attribute_count: 0,
            id_index: 0,
            class_index: 0,
            style_index: 0,
        }
    }
}

impl ResXmlStartElement {
    pub const SIZE: u16 = 0x14;

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let namespace = r.read_i32::<LittleEndian>()?;
        let name = r.read_i32::<LittleEndian>()?;
        let attribute_start = r.read_u16::<LittleEndian>()?;
        let attribute_size = r.read_u16::<LittleEndian>()?;
        let attribute_count = r.read_u16::<LittleEndian>()?;
        let id_index = r.read_u16::<LittleEndian>()?;
        let class_index = r.read_u16::<LittleEndian>()?;
        let style_index = r.read_u16::<LittleEndian>()?;
        Ok(Self {
            namespace,
            name,
            attribute_start,
            attribute_size,
            attribute_count,
            id_index,
            class_index,
            style_index,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace)?;
        w.write_i32::<LittleEndian>(self.name)?;
        w.write_u16::<LittleEndian>(self.attribute_start)?;
        w.write_u16::<LittleEndian>(self.attribute_size)?;
        w.write_u16::<LittleEndian>(self.attribute_count)?;
        w.write_u16::<LittleEndian>(self.id_index)?;
        w.write_u16::<LittleEndian>(self.class_index)?;
        w.write_u16::<LittleEndian>(self.style_index)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlAttribute {
    pub namespace: i32,
    pub name: i32,
    pub raw_value: i32,
    pub typed_value: ResValue,
}

impl ResXmlAttribute {
    pub const SIZE: u16 = 0x14;

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let namespace = r.read_i32::<LittleEndian>()?;
        let name = r.read_i32::<LittleEndian>()?;
        let raw_value = r.read_i32::<LittleEndian>()?;
        let typed_value = ResValue::read(r)?;
        Ok(Self {
            namespace,
            name,
            raw_value,
            typed_value,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace)?;
        w.write_i32::<LittleEndian>(self.name)?;
        w.write_i32::<LittleEndian>(self.raw_value)?;
        self.typed_value.write(w)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlEndElement {
    pub namespace: i32,
    pub name: i32,
}

impl ResXmlEndElement {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let namespace = r.read_i32::<LittleEndian>()?;
        let name = r.read_i32::<LittleEndian>()?;
        Ok(Self { namespace, name })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace)?;
        w.write_i32::<LittleEndian>(self.name)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlCdata {
    /// String pool index of the raw character data.
    pub data: i32,
    pub typed_data: ResValue,
}

impl ResXmlCdata {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let data = r.read_i32::<LittleEndian>()?;
        let typed_data = ResValue::read(r)?;
        Ok(Self { data, typed_data })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.data)?;
        self.typed_data.write(w)?;
        Ok(())
    }
}

/// Resource id laid out as `0xPPTTEEEE`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ResTableRef(u32);

impl ResTableRef {
    pub fn new(package: u8, ty: u8, entry: u16) -> Self {
        let package = (package as u32) << 24;
        let ty = (ty as u32) << 16;
        let entry = entry as u32;
        Self(package | ty | entry)
    }

    pub fn package(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn ty(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn entry(self) -> u16 {
        self.0 as u16
    }
}

impl From<u32> for ResTableRef {
    fn from(r: u32) -> Self {
        Self(r)
    }
}

impl From<ResTableRef> for u32 {
    fn from(r: ResTableRef) -> u32 {
        r.0
    }
}

impl std::fmt::Display for ResTableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResTablePackageHeader {
    pub id: u32,
    pub name: String,
    /// Offset of the type name pool from the package start.
    pub type_strings: u32,
    pub last_public_type: u32,
    /// Offset of the key name pool from the package start.
    pub key_strings: u32,
    pub last_public_key: u32,
    pub type_id_offset: u32,
}

impl ResTablePackageHeader {
    pub fn read(r: &mut impl Read, header_size: u16) -> Result<Self> {
        let id = r.read_u32::<LittleEndian>()?;
        let mut name = Vec::with_capacity(128);
        let mut terminated = false;
        for _ in 0..128 {
            let c = r.read_u16::<LittleEndian>()?;
            if c == 0 {
                terminated = true;
            }
            if !terminated {
                name.push(c);
            }
        }
        let name = String::from_utf16(&name)?;
        let type_strings = r.read_u32::<LittleEndian>()?;
        let last_public_type = r.read_u32::<LittleEndian>()?;
        let key_strings = r.read_u32::<LittleEndian>()?;
        let last_public_key = r.read_u32::<LittleEndian>()?;
        // Older tables end the header before this field.
        let type_id_offset = if header_size >= 288 {
            r.read_u32::<LittleEndian>()?
        } else {
            0
        };
        Ok(Self {
            id,
            name,
            type_strings,
            last_public_type,
            key_strings,
            last_public_key,
            type_id_offset,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.id)?;
        let mut name = [0u16; 128];
        for (slot, c) in name.iter_mut().zip(self.name.encode_utf16().take(127)) {
            *slot = c;
        }
        for c in name {
            w.write_u16::<LittleEndian>(c)?;
        }
        w.write_u32::<LittleEndian>(self.type_strings)?;
        w.write_u32::<LittleEndian>(self.last_public_type)?;
        w.write_u32::<LittleEndian>(self.key_strings)?;
        w.write_u32::<LittleEndian>(self.last_public_key)?;
        w.write_u32::<LittleEndian>(self.type_id_offset)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResTableTypeSpecHeader {
    pub id: u8,
    pub res0: u8,
    pub types_count: u16,
    pub entry_count: u32,
}

impl ResTableTypeSpecHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let id = r.read_u8()?;
        let res0 = r.read_u8()?;
        let types_count = r.read_u16::<LittleEndian>()?;
        let entry_count = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            id,
            res0,
            types_count,
            entry_count,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u8(self.id)?;
        w.write_u8(self.res0)?;
        w.write_u16::<LittleEndian>(self.types_count)?;
        w.write_u32::<LittleEndian>(self.entry_count)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResTableTypeHeader {
    pub id: u8,
    pub flags: u8,
    pub reserved: u16,
    pub entry_count: u32,
    pub entries_start: u32,
    pub config: ResTableConfig,
}

impl ResTableTypeHeader {
    pub const FLAG_SPARSE: u8 = 0x01;
    pub const FLAG_OFFSET16: u8 = 0x02;

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let id = r.read_u8()?;
        let flags = r.read_u8()?;
        let reserved = r.read_u16::<LittleEndian>()?;
        let entry_count = r.read_u32::<LittleEndian>()?;
        let entries_start = r.read_u32::<LittleEndian>()?;
        let config = ResTableConfig::read(r)?;
        Ok(Self {
            id,
            flags,
            reserved,
            entry_count,
            entries_start,
            config,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u8(self.id)?;
        w.write_u8(self.flags)?;
        w.write_u16::<LittleEndian>(self.reserved)?;
        w.write_u32::<LittleEndian>(self.entry_count)?;
        w.write_u32::<LittleEndian>(self.entries_start)?;
        self.config.write(w)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResTableConfig {
    pub size: u32,
    pub imsi: u32,
    pub locale: u32,
    pub screen_type: ScreenType,
    pub input: u32,
    pub screen_size: u32,
    pub version: u32,
    /// Newer qualifier fields, kept opaque.
    pub unknown: Vec<u8>,
}

impl Default for ResTableConfig {
    fn default() -> Self {
        Self {
            size: 28,
            imsi: 0,
            locale: 0,
            screen_type: ScreenType::default(),
            input: 0,
            screen_size: 0,
            version: 0,
            unknown: vec![],
        }
    }
}

impl ResTableConfig {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let size = r.read_u32::<LittleEndian>()?;
        let imsi = r.read_u32::<LittleEndian>()?;
        let locale = r.read_u32::<LittleEndian>()?;
        let screen_type = ScreenType::read(r)?;
        let input = r.read_u32::<LittleEndian>()?;
        let screen_size = r.read_u32::<LittleEndian>()?;
        let version = r.read_u32::<LittleEndian>()?;
        let unknown_len = (size as usize)
            .checked_sub(28)
            .with_context(|| format!("invalid config size {}", size))?;
        let mut unknown = vec![0; unknown_len];
        r.read_exact(&mut unknown)?;
        Ok(Self {
            size,
            imsi,
            locale,
            screen_type,
            input,
            screen_size,
            version,
            unknown,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.size)?;
        w.write_u32::<LittleEndian>(self.imsi)?;
        w.write_u32::<LittleEndian>(self.locale)?;
        self.screen_type.write(w)?;
        w.write_u32::<LittleEndian>(self.input)?;
        w.write_u32::<LittleEndian>(self.screen_size)?;
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_all(&self.unknown)?;
        Ok(())
    }

    /// True for the unqualified configuration (`res/values`, `res/drawable`).
    pub fn is_default(&self) -> bool {
        self.imsi == 0
            && self.locale == 0
            && self.screen_type == ScreenType::default()
            && self.input == 0
            && self.screen_size == 0
            && self.version == 0
            && self.unknown.iter().all(|b| *b == 0)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScreenType {
    pub orientation: u8,
    pub touchscreen: u8,
    pub density: u16,
}

impl ScreenType {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let orientation = r.read_u8()?;
        let touchscreen = r.read_u8()?;
        let density = r.read_u16::<LittleEndian>()?;
        Ok(Self {
            orientation,
            touchscreen,
            density,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u8(self.orientation)?;
        w.write_u8(self.touchscreen)?;
        w.write_u16::<LittleEndian>(self.density)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResTableEntry {
    pub size: u16,
    pub flags: u16,
    pub key: u32,
    pub value: ResTableValue,
}

impl ResTableEntry {
    pub const FLAG_COMPLEX: u16 = 0x0001;
    pub const FLAG_PUBLIC: u16 = 0x0002;
    pub const FLAG_COMPACT: u16 = 0x0008;

    pub fn simple(key: u32, value: ResValue) -> Self {
        Self {
            size: 8,
            flags: 0,
            key,
            value: ResTableValue::Simple(value),
        }
    }

    pub fn is_complex(&self) -> bool {
        self.flags & Self::FLAG_COMPLEX > 0
    }

    pub fn is_public(&self) -> bool {
        self.flags & Self::FLAG_PUBLIC > 0
    }

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let size_or_key = r.read_u16::<LittleEndian>()?;
        let flags = r.read_u16::<LittleEndian>()?;
        if flags & Self::FLAG_COMPACT > 0 {
            // Compact entries pack the value type into the high flag byte.
            let data = r.read_u32::<LittleEndian>()?;
            let value = ResValue {
                size: 8,
                res0: 0,
                data_type: (flags >> 8) as u8,
                data,
            };
            return Ok(Self {
                size: 8,
                flags: flags & 0x00ff & !Self::FLAG_COMPACT,
                key: size_or_key as u32,
                value: ResTableValue::Simple(value),
            });
        }
        let key = r.read_u32::<LittleEndian>()?;
        let is_complex = flags & Self::FLAG_COMPLEX > 0;
        let value = ResTableValue::read(r, is_complex)?;
        Ok(Self {
            size: size_or_key,
            flags,
            key,
            value,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16::<LittleEndian>(self.size)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u32::<LittleEndian>(self.key)?;
        self.value.write(w)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResTableValue {
    Simple(ResValue),
    Complex(ResTableMapEntry, Vec<ResTableMap>),
}

impl ResTableValue {
    pub fn read(r: &mut impl Read, is_complex: bool) -> Result<Self> {
        let res = if is_complex {
            let entry = ResTableMapEntry::read(r)?;
            let mut map = Vec::with_capacity(entry.count as usize);
            for _ in 0..entry.count {
                map.push(ResTableMap::read(r)?);
            }
            Self::Complex(entry, map)
        } else {
            Self::Simple(ResValue::read(r)?)
        };
        Ok(res)
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        match self {
            Self::Simple(value) => value.write(w)?,
            Self::Complex(entry, map) => {
                entry.write(w)?;
                for entry in map {
                    entry.write(w)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResValue {
    pub size: u16,
    pub res0: u8,
    pub data_type: u8,
    pub data: u32,
}

impl ResValue {
    pub fn new(data_type: ResValueType, data: u32) -> Self {
        Self {
            size: 8,
            res0: 0,
            data_type: data_type as u8,
            data,
        }
    }

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let size = r.read_u16::<LittleEndian>()?;
        let res0 = r.read_u8()?;
        let data_type = r.read_u8()?;
        let data = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            size,
            res0,
            data_type,
            data,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16::<LittleEndian>(self.size)?;
        w.write_u8(self.res0)?;
        w.write_u8(self.data_type)?;
        w.write_u32::<LittleEndian>(self.data)?;
        Ok(())
    }

    pub fn value_type(&self) -> Option<ResValueType> {
        ResValueType::from_u8(self.data_type)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ResValueType {
    Null = 0x00,
    Reference = 0x01,
    Attribute = 0x02,
    String = 0x03,
    Float = 0x04,
    Dimension = 0x05,
    Fraction = 0x06,
    DynamicReference = 0x07,
    IntDec = 0x10,
    IntHex = 0x11,
    IntBoolean = 0x12,
    IntColorArgb8 = 0x1c,
    IntColorRgb8 = 0x1d,
    IntColorArgb4 = 0x1e,
    IntColorRgb4 = 0x1f,
}

impl ResValueType {
    pub fn from_u8(ty: u8) -> Option<Self> {
        Some(match ty {
            x if x == Self::Null as u8 => Self::Null,
            x if x == Self::Reference as u8 => Self::Reference,
            x if x == Self::Attribute as u8 => Self::Attribute,
            x if x == Self::String as u8 => Self::String,
            x if x == Self::Float as u8 => Self::Float,
            x if x == Self::Dimension as u8 => Self::Dimension,
            x if x == Self::Fraction as u8 => Self::Fraction,
            x if x == Self::DynamicReference as u8 => Self::DynamicReference,
            x if x == Self::IntDec as u8 => Self::IntDec,
            x if x == Self::IntHex as u8 => Self::IntHex,
            x if x == Self::IntBoolean as u8 => Self::IntBoolean,
            x if x == Self::IntColorArgb8 as u8 => Self::IntColorArgb8,
            x if x == Self::IntColorRgb8 as u8 => Self::IntColorRgb8,
            x if x == Self::IntColorArgb4 as u8 => Self::IntColorArgb4,
            x if x == Self::IntColorRgb4 as u8 => Self::IntColorRgb4,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResTableMapEntry {
    pub parent: u32,
    pub count: u32,
}

impl ResTableMapEntry {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let parent = r.read_u32::<LittleEndian>()?;
        let count = r.read_u32::<LittleEndian>()?;
        Ok(Self { parent, count })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.parent)?;
        w.write_u32::<LittleEndian>(self.count)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResTableMap {
    pub name: u32,
    pub value: ResValue,
}

impl ResTableMap {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let name = r.read_u32::<LittleEndian>()?;
        let value = ResValue::read(r)?;
        Ok(Self { name, value })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.name)?;
        self.value.write(w)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResSpan {
    pub name: i32,
    pub first_char: u32,
    pub last_char: u32,
}

impl ResSpan {
    pub const END: u32 = 0xffff_ffff;

    pub fn read(r: &mut impl Read) -> Result<Option<Self>> {
        let name = r.read_i32::<LittleEndian>()?;
        if name as u32 == Self::END {
            return Ok(None);
        }
        let first_char = r.read_u32::<LittleEndian>()?;
        let last_char = r.read_u32::<LittleEndian>()?;
        Ok(Some(Self {
            name,
            first_char,
            last_char,
        }))
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.name)?;
        w.write_u32::<LittleEndian>(self.first_char)?;
        w.write_u32::<LittleEndian>(self.last_char)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Chunk {
    Null,
    StringPool(StringPool),
    Table(ResTableHeader, Vec<Chunk>),
    Xml(Vec<Chunk>),
    XmlStartNamespace(ResXmlNodeHeader, ResXmlNamespace),
    XmlEndNamespace(ResXmlNodeHeader, ResXmlNamespace),
    XmlStartElement(ResXmlNodeHeader, ResXmlStartElement, Vec<ResXmlAttribute>),
    XmlEndElement(ResXmlNodeHeader, ResXmlEndElement),
    XmlCdata(ResXmlNodeHeader, ResXmlCdata),
    XmlResourceMap(Vec<u32>),
    TablePackage(ResTablePackageHeader, Vec<Chunk>),
    /// Entries are always held densely, indexed by entry id.
    TableType(ResTableTypeHeader, Vec<Option<ResTableEntry>>),
    TableTypeSpec(ResTableTypeSpecHeader, Vec<u32>),
    /// A chunk this codec does not interpret; the bytes after the common
    /// header are kept verbatim.
    Unknown(ResChunkHeader, Vec<u8>),
}

impl Chunk {
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let start_pos = r.stream_position()?;
        let header = ResChunkHeader::read(r)?;
        anyhow::ensure!(
            header.header_size >= ResChunkHeader::SIZE && header.size >= header.header_size as u32,
            "malformed chunk header {:?} at {}",
            header,
            start_pos
        );
        let header_end = start_pos + header.header_size as u64;
        let end_pos = start_pos + header.size as u64;
        let stream_len = r.seek(SeekFrom::End(0))?;
        anyhow::ensure!(
            end_pos <= stream_len,
            "chunk at {} runs past the end of the data",
            start_pos
        );
        r.seek(SeekFrom::Start(start_pos + ResChunkHeader::SIZE as u64))?;
        let chunk = match ChunkType::from_u16(header.ty) {
            Some(ChunkType::Null) => {
                log::trace!("null");
                Chunk::Null
            }
            Some(ChunkType::StringPool) => {
                log::trace!("string pool");
                r.seek(SeekFrom::Start(start_pos))?;
                let mut data = vec![0; header.size as usize];
                r.read_exact(&mut data)?;
                Chunk::StringPool(StringPool::decode(&data, &header)?)
            }
            Some(ChunkType::Table) => {
                log::trace!("table");
                let table_header = ResTableHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                Chunk::Table(table_header, Self::parse_children(r, end_pos)?)
            }
            Some(ChunkType::Xml) => {
                log::trace!("xml");
                r.seek(SeekFrom::Start(header_end))?;
                Chunk::Xml(Self::parse_children(r, end_pos)?)
            }
            Some(ChunkType::XmlStartNamespace) => {
                log::trace!("xml start namespace");
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                let namespace = ResXmlNamespace::read(r)?;
                Chunk::XmlStartNamespace(node_header, namespace)
            }
            Some(ChunkType::XmlEndNamespace) => {
                log::trace!("xml end namespace");
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                let namespace = ResXmlNamespace::read(r)?;
                Chunk::XmlEndNamespace(node_header, namespace)
            }
            Some(ChunkType::XmlStartElement) => {
                log::trace!("xml start element");
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                let start_element = ResXmlStartElement::read(r)?;
                let mut attributes = Vec::with_capacity(start_element.attribute_count as usize);
                for i in 0..start_element.attribute_count as u64 {
                    let pos = header_end
                        + start_element.attribute_start as u64
                        + i * start_element.attribute_size as u64;
                    r.seek(SeekFrom::Start(pos))?;
                    attributes.push(ResXmlAttribute::read(r)?);
                }
                Chunk::XmlStartElement(node_header, start_element, attributes)
            }
            Some(ChunkType::XmlEndElement) => {
                log::trace!("xml end element");
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                let end_element = ResXmlEndElement::read(r)?;
                Chunk::XmlEndElement(node_header, end_element)
            }
            Some(ChunkType::XmlCdata) => {
                log::trace!("xml cdata");
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                let cdata = ResXmlCdata::read(r)?;
                Chunk::XmlCdata(node_header, cdata)
            }
            Some(ChunkType::XmlResourceMap) => {
                log::trace!("xml resource map");
                r.seek(SeekFrom::Start(header_end))?;
                let count = (header.size - header.header_size as u32) / 4;
                let mut resource_map = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    resource_map.push(r.read_u32::<LittleEndian>()?);
                }
                Chunk::XmlResourceMap(resource_map)
            }
            Some(ChunkType::TablePackage) => {
                log::trace!("table package");
                let package_header = ResTablePackageHeader::read(r, header.header_size)?;
                r.seek(SeekFrom::Start(header_end))?;
                Chunk::TablePackage(package_header, Self::parse_children(r, end_pos)?)
            }
            Some(ChunkType::TableType) => {
                log::trace!("table type");
                let type_header = ResTableTypeHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                let entries = Self::parse_type_entries(r, start_pos, &type_header)?;
                let type_header = ResTableTypeHeader {
                    flags: type_header.flags
                        & !(ResTableTypeHeader::FLAG_SPARSE | ResTableTypeHeader::FLAG_OFFSET16),
                    entry_count: entries.len() as u32,
                    ..type_header
                };
                Chunk::TableType(type_header, entries)
            }
            Some(ChunkType::TableTypeSpec) => {
                log::trace!("table type spec");
                let type_spec_header = ResTableTypeSpecHeader::read(r)?;
                r.seek(SeekFrom::Start(header_end))?;
                let mut type_spec = vec![0; type_spec_header.entry_count as usize];
                for c in type_spec.iter_mut() {
                    *c = r.read_u32::<LittleEndian>()?;
                }
                Chunk::TableTypeSpec(type_spec_header, type_spec)
            }
            None => {
                log::trace!("unknown chunk 0x{:04x}", header.ty);
                let mut body = vec![0; (header.size - ResChunkHeader::SIZE as u32) as usize];
                r.read_exact(&mut body)?;
                Chunk::Unknown(header, body)
            }
        };
        r.seek(SeekFrom::Start(end_pos))?;
        Ok(chunk)
    }

    fn parse_children<R: Read + Seek>(r: &mut R, end_pos: u64) -> Result<Vec<Chunk>> {
        let mut chunks = vec![];
        while r.stream_position()? < end_pos {
            chunks.push(Chunk::parse(r)?);
        }
        Ok(chunks)
    }

    fn parse_type_entries<R: Read + Seek>(
        r: &mut R,
        start_pos: u64,
        header: &ResTableTypeHeader,
    ) -> Result<Vec<Option<ResTableEntry>>> {
        // (entry id, byte offset from entries_start)
        let mut index = Vec::with_capacity(header.entry_count as usize);
        if header.flags & ResTableTypeHeader::FLAG_SPARSE > 0 {
            for _ in 0..header.entry_count {
                let id = r.read_u16::<LittleEndian>()?;
                let offset = r.read_u16::<LittleEndian>()? as u32 * 4;
                index.push((id as usize, offset));
            }
        } else if header.flags & ResTableTypeHeader::FLAG_OFFSET16 > 0 {
            for id in 0..header.entry_count as usize {
                let offset = r.read_u16::<LittleEndian>()?;
                if offset != 0xffff {
                    index.push((id, offset as u32 * 4));
                }
            }
        } else {
            for id in 0..header.entry_count as usize {
                let offset = r.read_u32::<LittleEndian>()?;
                if offset != 0xffff_ffff {
                    index.push((id, offset));
                }
            }
        }

        let len = if header.flags & ResTableTypeHeader::FLAG_SPARSE > 0 {
            index.iter().map(|(id, _)| id + 1).max().unwrap_or(0)
        } else {
            header.entry_count as usize
        };
        let mut entries = vec![None; len];
        let entries_base = start_pos + header.entries_start as u64;
        for (id, offset) in index {
            r.seek(SeekFrom::Start(entries_base + offset as u64))?;
            entries[id] = Some(ResTableEntry::read(r)?);
        }
        Ok(entries)
    }

    pub fn write<W: Seek + Write>(&self, w: &mut W) -> Result<()> {
        struct ChunkWriter {
            ty: ChunkType,
            start_chunk: u64,
            end_header: u64,
        }
        impl ChunkWriter {
            fn start_chunk<W: Seek + Write>(ty: ChunkType, w: &mut W) -> Result<Self> {
                let start_chunk = w.stream_position()?;
                ResChunkHeader::default().write(w)?;
                Ok(Self {
                    ty,
                    start_chunk,
                    end_header: 0,
                })
            }

            fn end_header<W: Seek + Write>(&mut self, w: &mut W) -> Result<()> {
                self.end_header = w.stream_position()?;
                Ok(())
            }

            fn end_chunk<W: Seek + Write>(self, w: &mut W) -> Result<(u64, u64)> {
                anyhow::ensure!(self.end_header != 0, "chunk header was never closed");
                let end_chunk = w.stream_position()?;
                let header = ResChunkHeader {
                    ty: self.ty as u16,
                    header_size: (self.end_header - self.start_chunk) as u16,
                    size: (end_chunk - self.start_chunk) as u32,
                };
                w.seek(SeekFrom::Start(self.start_chunk))?;
                header.write(w)?;
                w.seek(SeekFrom::Start(end_chunk))?;
                Ok((self.start_chunk, end_chunk))
            }
        }
        match self {
            Chunk::Null => {}
            Chunk::StringPool(pool) => pool.encode(w)?,
            Chunk::Table(table_header, chunks) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::Table, w)?;
                table_header.write(w)?;
                chunk.end_header(w)?;
                for chunk in chunks {
                    chunk.write(w)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::Xml(chunks) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::Xml, w)?;
                chunk.end_header(w)?;
                for chunk in chunks {
                    chunk.write(w)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::XmlStartNamespace(node_header, namespace) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlStartNamespace, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                namespace.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlEndNamespace(node_header, namespace) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlEndNamespace, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                namespace.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlStartElement(node_header, start_element, attributes) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlStartElement, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                ResXmlStartElement {
                    attribute_start: ResXmlStartElement::SIZE,
                    attribute_size: ResXmlAttribute::SIZE,
                    attribute_count: attributes.len() as u16,
                    ..*start_element
                }
                .write(w)?;
                for attr in attributes {
                    attr.write(w)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::XmlEndElement(node_header, end_element) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlEndElement, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                end_element.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlCdata(node_header, cdata) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlCdata, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                cdata.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlResourceMap(resource_map) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlResourceMap, w)?;
                chunk.end_header(w)?;
                for entry in resource_map {
                    w.write_u32::<LittleEndian>(*entry)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::TablePackage(package_header, chunks) => {
                let package_start = w.stream_position()?;
                let mut chunk = ChunkWriter::start_chunk(ChunkType::TablePackage, w)?;
                let mut package_header = package_header.clone();
                let header_start = w.stream_position()?;
                package_header.write(w)?;
                chunk.end_header(w)?;

                anyhow::ensure!(
                    chunks.len() >= 2,
                    "package {} lacks its type and key pools",
                    package_header.name
                );
                package_header.type_strings = (w.stream_position()? - package_start) as u32;
                chunks[0].write(w)?;
                package_header.key_strings = (w.stream_position()? - package_start) as u32;
                chunks[1].write(w)?;
                for chunk in &chunks[2..] {
                    chunk.write(w)?;
                }
                chunk.end_chunk(w)?;

                let end = w.stream_position()?;
                w.seek(SeekFrom::Start(header_start))?;
                package_header.write(w)?;
                w.seek(SeekFrom::Start(end))?;
            }
            Chunk::TableType(type_header, entries) => {
                let chunk_start = w.stream_position()?;
                let mut chunk = ChunkWriter::start_chunk(ChunkType::TableType, w)?;
                let header_start = w.stream_position()?;
                let mut type_header = ResTableTypeHeader {
                    entry_count: entries.len() as u32,
                    ..type_header.clone()
                };
                type_header.write(w)?;
                chunk.end_header(w)?;
                let index_start = w.stream_position()?;
                for _ in entries {
                    w.write_u32::<LittleEndian>(0)?;
                }
                let entries_start = w.stream_position()?;
                type_header.entries_start = (entries_start - chunk_start) as u32;
                let mut index = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry {
                        Some(entry) => {
                            index.push((w.stream_position()? - entries_start) as u32);
                            entry.write(w)?;
                        }
                        None => index.push(0xffff_ffff),
                    }
                }
                chunk.end_chunk(w)?;

                let end = w.stream_position()?;
                w.seek(SeekFrom::Start(header_start))?;
                type_header.write(w)?;
                w.seek(SeekFrom::Start(index_start))?;
                for offset in index {
                    w.write_u32::<LittleEndian>(offset)?;
                }
                w.seek(SeekFrom::Start(end))?;
            }
            Chunk::TableTypeSpec(type_spec_header, type_spec) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::TableTypeSpec, w)?;
                type_spec_header.write(w)?;
                chunk.end_header(w)?;
                for spec in type_spec {
                    w.write_u32::<LittleEndian>(*spec)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::Unknown(header, body) => {
                header.write(w)?;
                w.write_all(body)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn rewrite(chunk: &Chunk) -> Chunk {
        let mut buf = Cursor::new(vec![]);
        chunk.write(&mut buf).unwrap();
        buf.set_position(0);
        Chunk::parse(&mut buf).unwrap()
    }

    #[test]
    fn should_decode_long_utf8_strings() {
        let long = "x".repeat(300);
        let pool = StringPool {
            strings: vec!["short".into(), long.clone(), "ünïcödé".into()],
            styles: vec![],
            flags: ResStringPoolHeader::UTF8_FLAG,
        };
        match rewrite(&Chunk::StringPool(pool)) {
            Chunk::StringPool(parsed) => {
                assert_eq!(parsed.strings, vec!["short", long.as_str(), "ünïcödé"]);
                assert!(parsed.is_utf8());
            }
            other => panic!("unexpected chunk {:?}", other),
        }
    }

    #[test]
    fn should_keep_utf16_pools_utf16() {
        let pool = StringPool {
            strings: vec!["manifest".into(), "包名".into()],
            styles: vec![vec![ResSpan {
                name: 0,
                first_char: 0,
                last_char: 1,
            }]],
            flags: 0,
        };
        let mut first = Cursor::new(vec![]);
        Chunk::StringPool(pool.clone()).write(&mut first).unwrap();
        let parsed = Chunk::parse(&mut Cursor::new(first.get_ref().clone())).unwrap();
        assert_eq!(parsed, Chunk::StringPool(pool));

        let mut second = Cursor::new(vec![]);
        parsed.write(&mut second).unwrap();
        assert_eq!(first.into_inner(), second.into_inner());
    }

    #[test]
    fn should_preserve_unknown_chunks() {
        let header = ResChunkHeader {
            ty: 0x0206,
            header_size: 8,
            size: 16,
        };
        let chunk = Chunk::Xml(vec![Chunk::Unknown(header, vec![1, 2, 3, 4, 5, 6, 7, 8])]);
        assert_eq!(rewrite(&chunk), chunk);
    }

    #[test]
    fn should_expand_sparse_type_chunks() {
        let mut body = vec![];
        let header = ResTableTypeHeader {
            id: 1,
            flags: ResTableTypeHeader::FLAG_SPARSE,
            reserved: 0,
            entry_count: 1,
            entries_start: 8 + 12 + 28 + 4,
            config: ResTableConfig::default(),
        };
        header.write(&mut body).unwrap();
        // entry 3 at offset 0
        body.write_u16::<LittleEndian>(3).unwrap();
        body.write_u16::<LittleEndian>(0).unwrap();
        ResTableEntry::simple(7, ResValue::new(ResValueType::IntDec, 42))
            .write(&mut body)
            .unwrap();
        let mut data = vec![];
        ResChunkHeader {
            ty: ChunkType::TableType as u16,
            header_size: 8 + 12 + 28,
            size: 8 + body.len() as u32,
        }
        .write(&mut data)
        .unwrap();
        data.extend_from_slice(&body);

        let chunk = Chunk::parse(&mut Cursor::new(data)).unwrap();
        let Chunk::TableType(header, entries) = &chunk else {
            panic!("expected a type chunk");
        };
        assert_eq!(header.flags & ResTableTypeHeader::FLAG_SPARSE, 0);
        assert_eq!(entries.len(), 4);
        assert!(entries[0].is_none());
        assert_eq!(entries[3].as_ref().unwrap().key, 7);
        match rewrite(&chunk) {
            Chunk::TableType(_, rewritten) => assert_eq!(&rewritten, entries),
            other => panic!("unexpected chunk {:?}", other),
        }
    }
}
