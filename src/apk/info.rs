use super::axml::{AttrValue, Document};
use super::manifest::{self, ANDROID_NS};
use super::table::Table;
use super::{extract_zip_file, MANIFEST_NAME};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

const UNNAMED_FEATURE: &str = "(unnamed)";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApkInfo {
    pub package: Option<String>,
    pub version_name: Option<String>,
    pub version_code: Option<String>,
    pub app_name: Option<String>,
    pub min_sdk_version: Option<String>,
    pub target_sdk_version: Option<String>,
    pub permissions: Vec<String>,
    pub features: Vec<String>,
}

impl ApkInfo {
    /// Reads the manifest and resource table straight out of the archive.
    pub fn from_apk(apk: &Path) -> Result<Self> {
        let manifest = extract_zip_file(apk, MANIFEST_NAME)
            .with_context(|| format!("no {} in {}", MANIFEST_NAME, apk.display()))?;
        let doc = Document::parse(&manifest)?;
        let table = match Table::from_apk(apk) {
            Ok(table) => table,
            Err(err) => {
                log::warn!("Ignoring unreadable resource table: {:#}", err);
                None
            }
        };
        Ok(Self::from_manifest(&doc, table.as_ref()))
    }

    pub fn from_manifest(doc: &Document, table: Option<&Table>) -> Self {
        let mut info = Self::default();
        let Ok(root) = manifest::manifest_root(doc) else {
            return info;
        };
        let android = |id, name: &str| {
            doc.element(id)
                .and_then(|e| e.attribute(Some(ANDROID_NS), name))
                .map(|a| a.value.to_string())
        };
        info.package = manifest::package_name(doc).map(str::to_string);
        info.version_name = android(root, "versionName");
        info.version_code = android(root, "versionCode");
        if let Some(sdk) = doc.find_child(root, "uses-sdk") {
            info.min_sdk_version = android(sdk, "minSdkVersion");
            info.target_sdk_version = android(sdk, "targetSdkVersion");
        }
        for permission in doc
            .children_named(root, "uses-permission")
            .chain(doc.children_named(root, "uses-permission-sdk-23"))
        {
            if let Some(name) = android(permission, "name") {
                info.permissions.push(name);
            }
        }
        for feature in doc.children_named(root, "uses-feature") {
            info.features
                .push(android(feature, "name").unwrap_or_else(|| UNNAMED_FEATURE.to_string()));
        }
        info.app_name = match manifest::label(doc) {
            Some(AttrValue::Literal(label)) => Some(label.clone()),
            Some(value) => value
                .reference()
                .and_then(|id| table.and_then(|table| table.resolve_string(id))),
            None => None,
        };
        info
    }

    /// Flat key/value rendering with comma-joined lists. Empty lists and
    /// unknown values are left out.
    pub fn to_map(&self) -> BTreeMap<&'static str, String> {
        let mut map = BTreeMap::new();
        let fields = [
            ("package", &self.package),
            ("versionName", &self.version_name),
            ("versionCode", &self.version_code),
            ("appName", &self.app_name),
            ("minSdkVersion", &self.min_sdk_version),
            ("targetSdkVersion", &self.target_sdk_version),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                map.insert(key, value.clone());
            }
        }
        if !self.permissions.is_empty() {
            map.insert("permissions", self.permissions.join(", "));
        }
        if !self.features.is_empty() {
            map.insert("features", self.features.join(", "));
        }
        map
    }
}
