use crate::core::error::PipelineError;
use crate::core::workspace::CancelToken;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use zip::ZipArchive;

/// Maps an entry name onto a relative path, refusing anything that could
/// land outside the working tree.
pub(crate) fn entry_path(name: &str) -> Result<PathBuf, PipelineError> {
    let unsafe_name = || PipelineError::Container(format!("unsafe entry name `{}`", name));
    if name.starts_with('/') || name.starts_with('\\') {
        return Err(unsafe_name());
    }
    let mut path = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_name())
            }
        }
    }
    if name.split(&['/', '\\'][..]).any(|segment| segment == "..") {
        return Err(unsafe_name());
    }
    Ok(path)
}

/// Unpacks `apk` into `dest`, replacing whatever was there. Entries land in
/// a staging directory next to `dest` first, so a failed or cancelled run
/// leaves the previous tree untouched.
pub fn extract_apk(apk: &Path, dest: &Path, cancel: &CancelToken) -> Result<(), PipelineError> {
    cancel.check()?;
    let file = File::open(apk)
        .map_err(|e| PipelineError::Container(format!("cannot open {}: {}", apk.display(), e)))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| PipelineError::Container(format!("{}: {}", apk.display(), e)))?;

    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(parent)?;

    for i in 0..archive.len() {
        cancel.check()?;
        let mut entry = archive
            .by_index(i)
            .map_err(|e| PipelineError::Container(format!("entry {}: {}", i, e)))?;
        let relative = entry_path(entry.name())?;
        let target = staging.path().join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out).map_err(|e| {
            PipelineError::Container(format!("cannot inflate {}: {}", entry.name(), e))
        })?;
        log::debug!("Extracted {}", relative.display());
    }
    cancel.check()?;

    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    // the staging guard finds nothing left to remove after the rename
    fs::rename(staging.path(), dest)?;
    log::info!("Extracted {} into {}", apk.display(), dest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::testutil::write_apk;

    #[test]
    fn should_unpack_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("app.apk");
        write_apk(
            &apk,
            &[
                ("AndroidManifest.xml", b"manifest".to_vec()),
                ("assets/", vec![]),
                ("res/values/strings.xml", b"<resources/>".to_vec()),
            ],
        );
        let dest = dir.path().join("work/app");
        fs::create_dir_all(dest.join("stale")).unwrap();

        extract_apk(&apk, &dest, &CancelToken::new()).unwrap();
        assert_eq!(fs::read(dest.join("AndroidManifest.xml")).unwrap(), b"manifest");
        assert!(dest.join("assets").is_dir());
        assert!(dest.join("res/values/strings.xml").is_file());
        assert!(!dest.join("stale").exists());
    }

    #[test]
    fn should_reject_escaping_entries() {
        assert!(entry_path("../evil").is_err());
        assert!(entry_path("res/../../evil").is_err());
        assert!(entry_path("/etc/passwd").is_err());
        assert_eq!(
            entry_path("res/./drawable/a.png").unwrap(),
            PathBuf::from("res/drawable/a.png")
        );
    }

    #[test]
    fn should_reject_non_zip_input() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("broken.apk");
        fs::write(&apk, b"not a zip").unwrap();
        let err = extract_apk(&apk, &dir.path().join("out"), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Container(_)));
    }

    #[test]
    fn should_stop_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("app.apk");
        write_apk(&apk, &[("a.txt", b"a".to_vec())]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = extract_apk(&apk, &dir.path().join("out"), &cancel).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn should_keep_the_previous_tree_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("app.apk");
        write_apk(&apk, &[("a.txt", b"a".to_vec())]);
        let dest = dir.path().join("work/app");
        extract_apk(&apk, &dest, &CancelToken::new()).unwrap();
        fs::write(dest.join("patched.txt"), b"edited").unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = extract_apk(&apk, &dest, &cancel).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(fs::read(dest.join("patched.txt")).unwrap(), b"edited");
        assert!(dest.join("a.txt").is_file());
        let siblings: Vec<_> = fs::read_dir(dir.path().join("work")).unwrap().collect();
        assert_eq!(siblings.len(), 1);
    }

    #[test]
    fn should_keep_the_previous_tree_on_a_bad_entry() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("work/app");
        let good = dir.path().join("good.apk");
        write_apk(&good, &[("a.txt", b"a".to_vec())]);
        extract_apk(&good, &dest, &CancelToken::new()).unwrap();

        let evil = dir.path().join("evil.apk");
        write_apk(&evil, &[("b.txt", b"b".to_vec()), ("../escape.txt", b"x".to_vec())]);
        let err = extract_apk(&evil, &dest, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Container(_)));
        assert!(dest.join("a.txt").is_file());
        assert!(!dest.join("b.txt").exists());
        assert!(!dir.path().join("work/escape.txt").exists());
        let siblings: Vec<_> = fs::read_dir(dir.path().join("work")).unwrap().collect();
        assert_eq!(siblings.len(), 1);
    }
}
