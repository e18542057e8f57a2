//! Package identity and label edits on a parsed `AndroidManifest.xml`.
use super::axml::{AttrValue, Attribute, Document, NodeId};
use crate::core::error::PipelineError;
use std::io::Write;
use std::path::Path;

pub const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";

/// What an identity patch changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityPatch {
    /// `None` when the `package` attribute had to be created.
    pub old_package: Option<String>,
    /// Attribute values rewritten outside `manifest@package`.
    pub rewritten: usize,
}

pub fn manifest_root(doc: &Document) -> Result<NodeId, PipelineError> {
    doc.find_roots("manifest")
        .next()
        .ok_or_else(|| PipelineError::ManifestStructure("no <manifest> root element".into()))
}

pub fn application(doc: &Document) -> Result<NodeId, PipelineError> {
    let manifest = manifest_root(doc)?;
    doc.find_child(manifest, "application").ok_or_else(|| {
        PipelineError::ManifestStructure("<manifest> has no <application> child".into())
    })
}

pub fn package_name(doc: &Document) -> Option<&str> {
    let manifest = manifest_root(doc).ok()?;
    doc.element(manifest)?
        .attribute(None, "package")?
        .value
        .as_str()
}

fn is_label(attr: &Attribute) -> bool {
    attr.name == "label" && matches!(attr.namespace.as_deref(), None | Some(ANDROID_NS))
}

/// The application label as stored, literal or reference.
pub fn label(doc: &Document) -> Option<&AttrValue> {
    let application = application(doc).ok()?;
    doc.element(application)?
        .attributes
        .iter()
        .find(|attr| is_label(attr))
        .map(|attr| &attr.value)
}

/// Replaces the package name and every string attribute that embeds it.
///
/// References to the old package's `MainActivity` keep pointing at the class
/// that ships in the dex files, so `<old>.MainActivity` and values ending in
/// `.<old>.MainActivity` stay as they are.
pub fn patch_identity(doc: &mut Document, new_package: &str) -> Result<IdentityPatch, PipelineError> {
    let manifest = manifest_root(doc)?;
    let element = doc
        .element_mut(manifest)
        .ok_or_else(|| PipelineError::ManifestStructure("<manifest> is not an element".into()))?;

    let old_package = match element.attribute_mut(None, "package") {
        Some(attr) => {
            let old = attr.value.to_string();
            attr.value = AttrValue::Literal(new_package.to_string());
            Some(old)
        }
        None => {
            element.attributes.push(Attribute {
                namespace: None,
                name: "package".to_string(),
                resource_id: None,
                value: AttrValue::Literal(new_package.to_string()),
            });
            None
        }
    };

    let mut rewritten = 0;
    if let Some(old) = old_package.as_deref().filter(|old| !old.is_empty()) {
        let main_activity = format!("{}.MainActivity", old);
        let nested_main_activity = format!(".{}.MainActivity", old);
        let ids: Vec<NodeId> = doc.node_ids().collect();
        for id in ids {
            let Some(element) = doc.element_mut(id) else {
                continue;
            };
            for attr in element.attributes.iter_mut() {
                if id == manifest && attr.name == "package" && attr.namespace.is_none() {
                    continue;
                }
                let AttrValue::Literal(value) = &mut attr.value else {
                    continue;
                };
                if !value.contains(old)
                    || *value == main_activity
                    || value.ends_with(&nested_main_activity)
                {
                    continue;
                }
                let patched = value.replace(old, new_package);
                if patched == *value {
                    continue;
                }
                log::debug!("{}: {} -> {}", attr.name, value, patched);
                *value = patched;
                rewritten += 1;
            }
        }
    }

    log::info!(
        "Package renamed from {} to {}, {} references rewritten",
        old_package.as_deref().unwrap_or("<none>"),
        new_package,
        rewritten
    );
    Ok(IdentityPatch {
        old_package,
        rewritten,
    })
}

/// Sets the application label to a literal and returns what it was before.
pub fn patch_label(doc: &mut Document, new_label: &str) -> Result<Option<AttrValue>, PipelineError> {
    let application = application(doc)?;
    let element = doc.element_mut(application).ok_or_else(|| {
        PipelineError::ManifestStructure("<application> is not an element".into())
    })?;
    let literal = AttrValue::Literal(new_label.to_string());
    match element.attributes.iter_mut().find(|attr| is_label(attr)) {
        Some(attr) => Ok(Some(std::mem::replace(&mut attr.value, literal))),
        None => {
            element.attributes.push(Attribute {
                namespace: Some(ANDROID_NS.to_string()),
                name: "label".to_string(),
                resource_id: None,
                value: literal,
            });
            Ok(None)
        }
    }
}

pub fn read_manifest(path: &Path) -> Result<Document, PipelineError> {
    let bytes = std::fs::read(path)?;
    Document::parse(&bytes).map_err(|e| PipelineError::ManifestFormat(format!("{:#}", e)))
}

/// Replaces the manifest through a temporary file in the same directory.
pub fn write_manifest(path: &Path, doc: &Document) -> Result<(), PipelineError> {
    let bytes = doc
        .to_bytes()
        .map_err(|e| PipelineError::ManifestFormat(format!("{:#}", e)))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| PipelineError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::testutil::{literal, sample_manifest, sample_manifest_doc};

    fn attribute_values(doc: &Document) -> Vec<String> {
        doc.node_ids()
            .filter_map(|id| doc.element(id))
            .flat_map(|e| e.attributes.iter())
            .filter_map(|a| a.value.as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn should_rewrite_every_occurrence_of_the_old_package() {
        let mut doc = sample_manifest_doc("com.old.app", Some("Old"));
        let patch = patch_identity(&mut doc, "com.new.app").unwrap();
        assert_eq!(patch.old_package.as_deref(), Some("com.old.app"));
        assert_eq!(package_name(&doc), Some("com.new.app"));

        let values = attribute_values(&doc);
        assert!(values.contains(&"com.new.app.Provider;com.new.app.Service".to_string()));
        assert!(values.contains(&"com.new.app.permission.C2D_MESSAGE".to_string()));
        assert!(values.contains(&"com.new.app.SettingsActivity".to_string()));
        assert!(values.contains(&"com.old.app.MainActivity".to_string()));
        assert!(!values.iter().any(|v| v.contains("com.old.app")
            && v != "com.old.app.MainActivity"));
    }

    #[test]
    fn should_patch_a_tool_built_manifest() {
        let bytes = include_bytes!("../../testdata/manifest_utf16.axml");
        let mut doc = Document::parse(bytes).unwrap();
        let patch = patch_identity(&mut doc, "com.acme.notes").unwrap();
        assert_eq!(patch.old_package.as_deref(), Some("com.example.notes"));
        assert_eq!(patch.rewritten, 2);
        let previous = patch_label(&mut doc, "Acme Notes").unwrap();
        assert_eq!(previous.and_then(|v| v.reference()), Some(0x7f0b_0000));

        let reparsed = Document::parse(&doc.to_bytes().unwrap()).unwrap();
        assert_eq!(package_name(&reparsed), Some("com.acme.notes"));
        let values = attribute_values(&reparsed);
        assert!(values.contains(&"com.acme.notes.permission.C2D_MESSAGE".to_string()));
        assert!(values.contains(&"com.acme.notes.androidx-startup".to_string()));
        assert!(values.contains(&"com.example.notes.MainActivity".to_string()));
        assert!(values.contains(&"androidx.startup.InitializationProvider".to_string()));

        let application = application(&reparsed).unwrap();
        let label = reparsed
            .element(application)
            .unwrap()
            .attribute(Some(ANDROID_NS), "label")
            .unwrap();
        assert_eq!(label.resource_id, Some(0x0101_0001));
        assert_eq!(label.value.as_str(), Some("Acme Notes"));
        let manifest = reparsed.element(manifest_root(&reparsed).unwrap()).unwrap();
        assert_eq!(
            manifest
                .attribute(Some(ANDROID_NS), "versionCode")
                .unwrap()
                .value
                .as_int(),
            Some(7)
        );
    }

    #[test]
    fn should_be_idempotent() {
        let mut once = sample_manifest_doc("com.old.app", None);
        patch_identity(&mut once, "com.new.app").unwrap();
        let mut twice = once.clone();
        let patch = patch_identity(&mut twice, "com.new.app").unwrap();
        assert_eq!(once.to_bytes().unwrap(), twice.to_bytes().unwrap());
        assert_eq!(patch.rewritten, 0);
    }

    #[test]
    fn should_leave_nested_main_activity_references() {
        let mut doc = sample_manifest_doc("com.old.app", None);
        let application = application(&doc).unwrap();
        let alias = doc.append_element(Some(application), None, "activity-alias");
        doc.element_mut(alias).unwrap().attributes.push(literal(
            Some(ANDROID_NS),
            "targetActivity",
            Some(0x0101_0202),
            "org.vendor.com.old.app.MainActivity",
        ));
        patch_identity(&mut doc, "com.new.app").unwrap();
        let target = doc
            .element(alias)
            .unwrap()
            .attribute(Some(ANDROID_NS), "targetActivity")
            .unwrap();
        assert_eq!(
            target.value.as_str(),
            Some("org.vendor.com.old.app.MainActivity")
        );
    }

    #[test]
    fn should_synthesize_a_missing_package_without_sweeping() {
        let mut doc = sample_manifest_doc("com.old.app", None);
        let manifest = manifest_root(&doc).unwrap();
        doc.element_mut(manifest)
            .unwrap()
            .attributes
            .retain(|a| a.name != "package");
        let patch = patch_identity(&mut doc, "com.new.app").unwrap();
        assert_eq!(patch.old_package, None);
        assert_eq!(patch.rewritten, 0);
        assert_eq!(package_name(&doc), Some("com.new.app"));
        assert!(attribute_values(&doc).contains(&"com.old.app.SettingsActivity".to_string()));
    }

    #[test]
    fn should_replace_a_label_reference_with_a_literal() {
        let mut doc = sample_manifest_doc("com.old.app", None);
        let previous = patch_label(&mut doc, "New App").unwrap().unwrap();
        assert!(previous.reference().is_some());

        let reparsed = Document::parse(&doc.to_bytes().unwrap()).unwrap();
        let application = application(&reparsed).unwrap();
        let label = reparsed
            .element(application)
            .unwrap()
            .attribute(Some(ANDROID_NS), "label")
            .unwrap();
        assert_eq!(label.value.as_str(), Some("New App"));
        assert_eq!(label.resource_id, Some(crate::apk::testutil::LABEL_ID));
    }

    #[test]
    fn should_create_a_missing_label() {
        let mut doc = sample_manifest_doc("com.old.app", None);
        let application = application(&doc).unwrap();
        doc.element_mut(application)
            .unwrap()
            .attributes
            .retain(|a| a.name != "label");
        assert_eq!(patch_label(&mut doc, "Fresh").unwrap(), None);
        let reparsed = Document::parse(&doc.to_bytes().unwrap()).unwrap();
        assert_eq!(
            label(&reparsed).and_then(AttrValue::as_str),
            Some("Fresh")
        );
    }

    #[test]
    fn should_fail_without_manifest_or_application() {
        let mut doc = Document::new(false);
        doc.append_element(None, None, "resources");
        assert!(matches!(
            patch_identity(&mut doc, "a.b"),
            Err(PipelineError::ManifestStructure(_))
        ));

        let mut doc = Document::new(false);
        doc.append_element(None, None, "manifest");
        assert!(patch_identity(&mut doc, "a.b").is_ok());
        assert!(matches!(
            patch_label(&mut doc, "x"),
            Err(PipelineError::ManifestStructure(_))
        ));
    }

    #[test]
    fn should_write_manifests_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AndroidManifest.xml");
        std::fs::write(&path, sample_manifest("com.old.app", Some("Old"))).unwrap();
        let mut doc = read_manifest(&path).unwrap();
        patch_identity(&mut doc, "com.new.app").unwrap();
        write_manifest(&path, &doc).unwrap();

        let reread = read_manifest(&path).unwrap();
        assert_eq!(package_name(&reread), Some("com.new.app"));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn should_report_garbage_as_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AndroidManifest.xml");
        std::fs::write(&path, b"<manifest/>").unwrap();
        assert!(matches!(
            read_manifest(&path),
            Err(PipelineError::ManifestFormat(_))
        ));
    }
}
