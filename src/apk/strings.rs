//! `app_name` edits in plain-text `res/values*/strings.xml` files.
use crate::core::error::PipelineError;
use anyhow::Result;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fs;
use std::io::Cursor;
use std::path::Path;

const APP_NAME_KEY: &str = "app_name";

/// Backslash-escapes the characters aapt treats specially in string values.
fn escape_resource_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        match c {
            '\\' | '\'' | '"' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '@' | '?' if i == 0 => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn is_app_name(e: &BytesStart) -> bool {
    e.name().as_ref() == b"string"
        && e.attributes()
            .flatten()
            .any(|attr| attr.key.as_ref() == b"name" && attr.value.as_ref() == APP_NAME_KEY.as_bytes())
}

fn write_value(writer: &mut Writer<Cursor<Vec<u8>>>, value: &str) -> Result<()> {
    writer.write_event(Event::Text(BytesText::new(&escape_resource_string(value))))?;
    Ok(())
}

/// Rewrites one `strings.xml` document, replacing or appending `app_name`.
pub fn set_app_name(xml: &str, new_name: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut found = false;
    let mut saw_resources = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) if is_app_name(&e) => {
                writer.write_event(Event::Start(e.clone()))?;
                write_value(&mut writer, new_name)?;
                reader.read_to_end(e.name())?;
                writer.write_event(Event::End(BytesEnd::new("string")))?;
                found = true;
            }
            Event::Empty(e) if is_app_name(&e) => {
                writer.write_event(Event::Start(e.clone()))?;
                write_value(&mut writer, new_name)?;
                writer.write_event(Event::End(BytesEnd::new("string")))?;
                found = true;
            }
            Event::End(e) if e.name().as_ref() == b"resources" => {
                saw_resources = true;
                if !found {
                    let start = BytesStart::new("string").with_attributes([("name", APP_NAME_KEY)]);
                    writer.write_event(Event::Text(BytesText::new("    ")))?;
                    writer.write_event(Event::Start(start))?;
                    write_value(&mut writer, new_name)?;
                    writer.write_event(Event::End(BytesEnd::new("string")))?;
                    writer.write_event(Event::Text(BytesText::new("\n")))?;
                    found = true;
                }
                writer.write_event(Event::End(e))?;
            }
            Event::Eof => break,
            event => writer.write_event(event)?,
        }
    }
    anyhow::ensure!(saw_resources, "no </resources> element");
    Ok(String::from_utf8(writer.into_inner().into_inner())?)
}

/// Updates `app_name` in every `res/values*/strings.xml` under `working_dir`.
/// Returns how many files were changed.
pub fn update_app_name(working_dir: &Path, new_name: &str) -> Result<usize, PipelineError> {
    let res = working_dir.join("res");
    if !res.is_dir() {
        return Err(PipelineError::NoStringsTableFound);
    }
    let mut dirs: Vec<_> = fs::read_dir(&res)?
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("values"))
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let mut updated = 0;
    for dir in dirs {
        let path = dir.join("strings.xml");
        if !path.is_file() {
            continue;
        }
        let result = fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|xml| set_app_name(&xml, new_name))
            .and_then(|xml| fs::write(&path, xml).map_err(anyhow::Error::from));
        match result {
            Ok(()) => {
                log::debug!("Updated app_name in {}", path.display());
                updated += 1;
            }
            Err(err) => log::warn!("Skipping {}: {:#}", path.display(), err),
        }
    }
    if updated == 0 {
        return Err(PipelineError::NoStringsTableFound);
    }
    log::info!("Updated app_name in {} strings.xml files", updated);
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_replace_an_existing_app_name() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<resources>
    <string name="title">Title</string>
    <string name="app_name">Old <b>App</b></string>
</resources>
"#;
        let out = set_app_name(xml, "New & Shiny").unwrap();
        assert!(out.contains(r#"<string name="app_name">New &amp; Shiny</string>"#));
        assert!(out.contains(r#"<string name="title">Title</string>"#));
        assert!(!out.contains("Old"));
        assert!(out.starts_with(r#"<?xml version="1.0" encoding="utf-8"?>"#));
    }

    #[test]
    fn should_append_a_missing_app_name() {
        let xml = "<resources>\n    <string name=\"title\">Title</string>\n</resources>\n";
        let out = set_app_name(xml, "New").unwrap();
        assert!(out.contains(r#"<string name="app_name">New</string>"#));
        assert!(out.find("app_name").unwrap() < out.find("</resources>").unwrap());
    }

    #[test]
    fn should_escape_apostrophes_for_aapt() {
        let out = set_app_name("<resources></resources>", "Bob's").unwrap();
        assert!(out.contains(r"Bob\&apos;s") || out.contains(r"Bob\'s"));
    }

    #[test]
    fn should_update_every_values_directory() {
        let dir = tempfile::tempdir().unwrap();
        let res = dir.path().join("res");
        for values in ["values", "values-de", "values-v21"] {
            fs::create_dir_all(res.join(values)).unwrap();
        }
        fs::create_dir_all(res.join("drawable")).unwrap();
        fs::write(
            res.join("values/strings.xml"),
            r#"<resources><string name="app_name">Old</string></resources>"#,
        )
        .unwrap();
        fs::write(res.join("values-de/strings.xml"), "<resources></resources>").unwrap();
        fs::write(res.join("values-v21/strings.xml"), "<resources><string>").unwrap();

        assert_eq!(update_app_name(dir.path(), "New").unwrap(), 2);
        for values in ["values", "values-de"] {
            let xml = fs::read_to_string(res.join(values).join("strings.xml")).unwrap();
            assert!(xml.contains(r#"<string name="app_name">New</string>"#), "{}", xml);
        }
    }

    #[test]
    fn should_report_a_missing_strings_table() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            update_app_name(dir.path(), "New"),
            Err(PipelineError::NoStringsTableFound)
        ));
        fs::create_dir_all(dir.path().join("res/values")).unwrap();
        assert!(matches!(
            update_app_name(dir.path(), "New"),
            Err(PipelineError::NoStringsTableFound)
        ));
    }
}
