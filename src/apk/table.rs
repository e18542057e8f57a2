//! Read-only lookups into `resources.arsc`.
use super::res::{Chunk, ResTableConfig, ResTableEntry, ResTableRef, ResTableValue, ResValueType};
use super::{extract_optional_zip_file, RESOURCES_NAME};
use anyhow::{Context, Result};
use std::io::Cursor;
use std::path::Path;

/// Reference chains longer than this are treated as cycles.
const MAX_REFERENCE_DEPTH: usize = 16;

struct Package {
    id: u8,
    types: Vec<String>,
    keys: Vec<String>,
    chunks: Vec<Chunk>,
}

impl Package {
    fn new(id: u8, mut chunks: Vec<Chunk>) -> Result<Self> {
        anyhow::ensure!(chunks.len() >= 2, "invalid package {}", id);
        let rest = chunks.split_off(2);
        let mut pools = chunks.into_iter().map(|chunk| match chunk {
            Chunk::StringPool(pool) => Ok(pool.strings),
            _ => anyhow::bail!("invalid package {}", id),
        });
        let types = pools.next().context("missing type strings")??;
        let keys = pools.next().context("missing key strings")??;
        Ok(Self {
            id,
            types,
            keys,
            chunks: rest,
        })
    }

    /// Every configuration's value for one type and entry.
    fn lookup_entries(&self, ty: u8, entry: u16) -> Vec<(&ResTableConfig, &ResTableEntry)> {
        let mut found = vec![];
        for chunk in &self.chunks {
            if let Chunk::TableType(header, entries) = chunk {
                if header.id == ty {
                    if let Some(Some(e)) = entries.get(entry as usize) {
                        found.push((&header.config, e));
                    }
                }
            }
        }
        found
    }
}

pub struct Table {
    strings: Vec<String>,
    packages: Vec<Package>,
}

impl Table {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let chunk = Chunk::parse(&mut Cursor::new(bytes)).context("invalid resource table")?;
        let Chunk::Table(_, chunks) = chunk else {
            anyhow::bail!("not a resource table");
        };
        let mut strings = vec![];
        let mut packages = vec![];
        for chunk in chunks {
            match chunk {
                Chunk::StringPool(pool) => strings = pool.strings,
                Chunk::TablePackage(header, chunks) => {
                    packages.push(Package::new(header.id as u8, chunks)?)
                }
                _ => {}
            }
        }
        Ok(Self { strings, packages })
    }

    /// `None` when the archive carries no resource table.
    pub fn from_apk(apk: &Path) -> Result<Option<Self>> {
        match extract_optional_zip_file(apk, RESOURCES_NAME)? {
            Some(bytes) => Ok(Some(Self::parse(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn from_dir(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(RESOURCES_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(Self::parse(&std::fs::read(path)?)?))
    }

    fn lookup_package(&self, id: u8) -> Option<&Package> {
        self.packages.iter().find(|p| p.id == id)
    }

    fn lookup_entries(&self, id: ResTableRef) -> Vec<(&ResTableConfig, &ResTableEntry)> {
        match self.lookup_package(id.package()) {
            Some(package) if id.ty() > 0 && id.entry() != u16::MAX => {
                package.lookup_entries(id.ty(), id.entry())
            }
            _ => vec![],
        }
    }

    /// `type/name` of a resource, for diagnostics.
    pub fn entry_name(&self, id: ResTableRef) -> Option<String> {
        let package = self.lookup_package(id.package())?;
        let ty = package.types.get((id.ty() as usize).checked_sub(1)?)?;
        let (_, entry) = self.lookup_entries(id).into_iter().next()?;
        let key = package.keys.get(entry.key as usize)?;
        Some(format!("{}/{}", ty, key))
    }

    /// Resolves a resource to a string, following references and preferring
    /// the unqualified configuration.
    pub fn resolve_string(&self, id: u32) -> Option<String> {
        let mut id = ResTableRef::from(id);
        for _ in 0..MAX_REFERENCE_DEPTH {
            let entries = self.lookup_entries(id);
            let (_, entry) = entries
                .iter()
                .find(|(config, _)| config.is_default())
                .or_else(|| entries.first())?;
            let ResTableValue::Simple(value) = &entry.value else {
                return None;
            };
            match value.value_type()? {
                ResValueType::String => return self.strings.get(value.data as usize).cloned(),
                ResValueType::Reference => id = ResTableRef::from(value.data),
                _ => return None,
            }
        }
        log::warn!("Reference chain from {} is too deep", id);
        None
    }

    /// Every file path a resource points at across all configurations.
    pub fn resolve_files(&self, id: u32) -> Vec<String> {
        let mut files = vec![];
        self.collect_files(ResTableRef::from(id), 0, &mut files);
        files.sort();
        files.dedup();
        files
    }

    fn collect_files(&self, id: ResTableRef, depth: usize, files: &mut Vec<String>) {
        if depth >= MAX_REFERENCE_DEPTH {
            return;
        }
        for (_, entry) in self.lookup_entries(id) {
            let ResTableValue::Simple(value) = &entry.value else {
                continue;
            };
            match value.value_type() {
                Some(ResValueType::String) => {
                    if let Some(path) = self.strings.get(value.data as usize) {
                        if path.starts_with("res/") {
                            files.push(path.clone());
                        }
                    }
                }
                Some(ResValueType::Reference) => {
                    self.collect_files(ResTableRef::from(value.data), depth + 1, files)
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::testutil::{sample_table, APP_NAME_REF, ICON_REF};

    #[test]
    fn should_prefer_the_default_configuration() {
        let table = Table::parse(&sample_table("Old App")).unwrap();
        assert_eq!(table.resolve_string(APP_NAME_REF).as_deref(), Some("Old App"));
        assert_eq!(
            table.entry_name(APP_NAME_REF.into()).as_deref(),
            Some("string/app_name")
        );
    }

    #[test]
    fn should_list_files_of_every_density() {
        let table = Table::parse(&sample_table("Old App")).unwrap();
        assert_eq!(
            table.resolve_files(ICON_REF),
            vec![
                "res/mipmap-mdpi/ic_launcher.png".to_string(),
                "res/mipmap-xxhdpi/ic_launcher.webp".to_string(),
            ]
        );
    }

    #[test]
    fn should_return_nothing_for_unknown_ids() {
        let table = Table::parse(&sample_table("Old App")).unwrap();
        assert_eq!(table.resolve_string(0x7f05_0001), None);
        assert_eq!(table.resolve_string(0x0101_0001), None);
        assert!(table.resolve_files(0x7f02_0009).is_empty());
    }
}
