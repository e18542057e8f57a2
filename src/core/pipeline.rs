//! The repackaging pipeline as one facade: extract, patch, repackage, sign.
use super::config::PipelineConfig;
use super::error::{PipelineError, SigningError};
use super::workspace::{self, CancelToken};
use crate::apk::assemble::{self, ZipEntryDescriptor};
use crate::apk::axml::AttrValue;
use crate::apk::info::ApkInfo;
use crate::apk::keystore;
use crate::apk::manifest::{self, IdentityPatch};
use crate::apk::sign::{self, Signer, MIN_V2_SDK};
use crate::apk::{align, extract, icon, strings, MANIFEST_NAME};
use rasn_pkix::Certificate;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Where a new application name ended up.
#[derive(Clone, Debug, PartialEq)]
pub enum AppNamePatch {
    /// The manifest label now holds the name. `previous` is what it held
    /// before; `strings_updated` counts `strings.xml` files also updated
    /// because the old label was a resource reference.
    Manifest {
        previous: Option<AttrValue>,
        strings_updated: usize,
    },
    /// The manifest could not be patched, `app_name` was changed in this
    /// many `strings.xml` files instead.
    Strings(usize),
}

/// Keystore and passphrases for one signing attempt.
#[derive(Clone, Debug)]
pub struct SigningCredentials {
    pub keystore: PathBuf,
    pub store_password: String,
    pub alias: String,
    pub key_password: String,
}

/// Everything `run` needs. Stages whose input is `None` are skipped.
#[derive(Clone, Debug)]
pub struct Job {
    pub source: PathBuf,
    pub output: PathBuf,
    pub package_name: Option<String>,
    pub app_name: Option<String>,
    pub icon: Option<PathBuf>,
    /// Without credentials the output is aligned but unsigned.
    pub credentials: Option<SigningCredentials>,
}

pub struct ApkReverseEngineer {
    config: PipelineConfig,
    cancel: CancelToken,
}

fn ensure_parent(path: &Path) -> std::io::Result<PathBuf> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

impl ApkReverseEngineer {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Cancelling the returned token stops every running stage of this
    /// instance after its current entry.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// `<work root>/<source file stem>`.
    pub fn working_dir_for(&self, apk: &Path) -> PathBuf {
        let stem = apk
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "apk".to_string());
        self.config.workspace.root.join(stem)
    }

    pub fn get_info(&self, apk: &Path) -> Result<ApkInfo, PipelineError> {
        if !apk.is_file() {
            return Err(PipelineError::Container(format!(
                "{} does not exist",
                apk.display()
            )));
        }
        ApkInfo::from_apk(apk).map_err(|e| PipelineError::Container(format!("{:#}", e)))
    }

    pub fn extract(&self, apk: &Path) -> Result<PathBuf, PipelineError> {
        let working_dir = self.working_dir_for(apk);
        workspace::with_lock(&working_dir, || self.extract_locked(apk, &working_dir))?;
        Ok(working_dir)
    }

    fn extract_locked(&self, apk: &Path, working_dir: &Path) -> Result<(), PipelineError> {
        extract::extract_apk(apk, working_dir, &self.cancel)
    }

    pub fn patch_package_name(
        &self,
        working_dir: &Path,
        new_name: &str,
    ) -> Result<IdentityPatch, PipelineError> {
        workspace::with_lock(working_dir, || {
            self.patch_package_name_locked(working_dir, new_name)
        })
    }

    fn patch_package_name_locked(
        &self,
        working_dir: &Path,
        new_name: &str,
    ) -> Result<IdentityPatch, PipelineError> {
        self.cancel.check()?;
        let path = working_dir.join(MANIFEST_NAME);
        let mut doc = manifest::read_manifest(&path)?;
        let patch = manifest::patch_identity(&mut doc, new_name)?;
        manifest::write_manifest(&path, &doc)?;
        Ok(patch)
    }

    pub fn patch_app_name(
        &self,
        working_dir: &Path,
        new_name: &str,
    ) -> Result<AppNamePatch, PipelineError> {
        workspace::with_lock(working_dir, || self.patch_app_name_locked(working_dir, new_name))
    }

    fn patch_app_name_locked(
        &self,
        working_dir: &Path,
        new_name: &str,
    ) -> Result<AppNamePatch, PipelineError> {
        self.cancel.check()?;
        let path = working_dir.join(MANIFEST_NAME);
        let patched = if path.is_file() {
            manifest::read_manifest(&path).and_then(|mut doc| {
                let previous = manifest::patch_label(&mut doc, new_name)?;
                manifest::write_manifest(&path, &doc)?;
                Ok(previous)
            })
        } else {
            Err(PipelineError::ManifestStructure(format!(
                "{} not found",
                path.display()
            )))
        };

        match patched {
            Ok(previous) => {
                log::info!("Application label set to {}", new_name);
                let mut strings_updated = 0;
                if previous.as_ref().and_then(AttrValue::reference).is_some() {
                    match strings::update_app_name(working_dir, new_name) {
                        Ok(count) => strings_updated = count,
                        Err(err) => log::debug!("No strings.xml to follow the label: {}", err),
                    }
                }
                Ok(AppNamePatch::Manifest {
                    previous,
                    strings_updated,
                })
            }
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(err) => {
                log::warn!("Cannot patch the manifest label, trying strings.xml: {}", err);
                strings::update_app_name(working_dir, new_name).map(AppNamePatch::Strings)
            }
        }
    }

    /// Returns how many icon files were replaced.
    pub fn patch_icon(&self, working_dir: &Path, image: &Path) -> Result<usize, PipelineError> {
        workspace::with_lock(working_dir, || {
            icon::substitute_icons(working_dir, image, &self.config.icon, &self.cancel)
        })
    }

    /// Packs `working_dir` and writes the aligned container to `out`.
    pub fn repackage(
        &self,
        working_dir: &Path,
        out: &Path,
    ) -> Result<Vec<ZipEntryDescriptor>, PipelineError> {
        workspace::with_lock(working_dir, || self.repackage_locked(working_dir, out))
    }

    fn repackage_locked(
        &self,
        working_dir: &Path,
        out: &Path,
    ) -> Result<Vec<ZipEntryDescriptor>, PipelineError> {
        let dir = ensure_parent(out)?;
        let mut unaligned = NamedTempFile::new_in(dir)?;
        let entries = assemble::reassemble(working_dir, unaligned.as_file_mut(), &self.cancel)?;
        unaligned.as_file().sync_all()?;
        align::align_file(unaligned.path(), out, &self.config.align, &self.cancel)?;
        Ok(entries)
    }

    pub fn sign(
        &self,
        unsigned: &Path,
        keystore: &Path,
        store_password: &str,
        alias: &str,
        key_password: &str,
        out: &Path,
    ) -> Result<(), SigningError> {
        let min_sdk = self.config.signing.min_sdk_version;
        if min_sdk < MIN_V2_SDK {
            return Err(SigningError::MinSdkTooLow(min_sdk));
        }
        if !unsigned.is_file() {
            return Err(SigningError::InputMissing(unsigned.display().to_string()));
        }
        log::info!(
            "Signing {} with {} (alias {})",
            unsigned.display(),
            keystore.display(),
            alias
        );
        let credential = keystore::load_credential(keystore, store_password, alias, key_password)?;
        let signer = Signer::from_credential(credential);
        ensure_parent(out).map_err(|e| SigningError::Apk(e.to_string()))?;
        sign::sign(unsigned, out, &signer).map_err(|e| SigningError::Apk(format!("{:#}", e)))?;
        self.verify(out)?;
        Ok(())
    }

    pub fn verify(&self, signed: &Path) -> Result<Vec<Certificate>, SigningError> {
        sign::verify(signed).map_err(|e| SigningError::Apk(format!("verification failed: {:#}", e)))
    }

    /// Removes the whole work root.
    pub fn cleanup(&self) -> Result<(), PipelineError> {
        let root = &self.config.workspace.root;
        if root.exists() {
            fs::remove_dir_all(root)?;
            log::info!("Removed {}", root.display());
        }
        Ok(())
    }

    /// Runs every requested stage on `job.source` under its working-tree lock.
    pub fn run(&self, job: &Job) -> Result<PathBuf, PipelineError> {
        let working_dir = self.working_dir_for(&job.source);
        workspace::with_lock(&working_dir, || self.run_locked(job, &working_dir))?;
        Ok(job.output.clone())
    }

    fn run_locked(&self, job: &Job, working_dir: &Path) -> Result<(), PipelineError> {
        self.extract_locked(&job.source, working_dir)?;
        if let Some(package_name) = &job.package_name {
            self.patch_package_name_locked(working_dir, package_name)?;
        }
        if let Some(app_name) = &job.app_name {
            self.patch_app_name_locked(working_dir, app_name)?;
        }
        if let Some(image) = &job.icon {
            self.cancel.check()?;
            let replaced =
                icon::substitute_icons(working_dir, image, &self.config.icon, &self.cancel)?;
            if replaced == 0 {
                log::warn!("No icon files matched, keeping the original icons");
            }
        }
        self.cancel.check()?;

        let Some(credentials) = &job.credentials else {
            self.repackage_locked(working_dir, &job.output)?;
            return Ok(());
        };
        let stale = assemble::remove_v1_signature(working_dir)?;
        if !stale.is_empty() {
            log::info!("Dropping v1 signature files: {}", stale.join(", "));
        }
        let dir = ensure_parent(&job.output)?;
        let unsigned = NamedTempFile::new_in(dir)?;
        self.repackage_locked(working_dir, unsigned.path())?;
        self.cancel.check()?;
        self.sign(
            unsigned.path(),
            &credentials.keystore,
            &credentials.store_password,
            &credentials.alias,
            &credentials.key_password,
            &job.output,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::axml::Document;
    use crate::apk::testutil::{png_bytes, sample_manifest, sample_table, write_apk};
    use crate::core::error::Outcome;
    use std::fs::File;
    use zip::ZipArchive;

    const TESTDATA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata");

    fn engineer(root: &Path) -> ApkReverseEngineer {
        let mut config = PipelineConfig::default();
        config.workspace.root = root.join("work");
        ApkReverseEngineer::new(config)
    }

    fn source_apk(dir: &Path, label: Option<&str>) -> PathBuf {
        let apk = dir.join("source.apk");
        write_apk(
            &apk,
            &[
                (MANIFEST_NAME, sample_manifest("com.old.app", label)),
                ("classes.dex", b"dex\n035\0".to_vec()),
                ("res/mipmap-mdpi/ic_launcher.png", png_bytes(48, 48)),
                ("res/values/strings.xml", br#"<resources><string name="app_name">Old App</string></resources>"#.to_vec()),
                ("resources.arsc", sample_table("Old App")),
                ("lib/arm64-v8a/libnative.so", vec![0x7f; 2000]),
            ],
        );
        apk
    }

    fn credentials(alias: &str) -> SigningCredentials {
        SigningCredentials {
            keystore: Path::new(TESTDATA).join("release.jks"),
            store_password: "jkspass".to_string(),
            alias: alias.to_string(),
            key_password: "keypass".to_string(),
        }
    }

    #[test]
    fn should_run_the_whole_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let engineer = engineer(dir.path());
        let image = dir.path().join("icon.png");
        fs::write(&image, png_bytes(512, 512)).unwrap();
        let job = Job {
            source: source_apk(dir.path(), None),
            output: dir.path().join("out/signed.apk"),
            package_name: Some("com.new.app".to_string()),
            app_name: Some("New App".to_string()),
            icon: Some(image),
            credentials: Some(credentials("bar")),
        };
        let signed = engineer.run(&job).unwrap();
        assert_eq!(engineer.verify(&signed).unwrap().len(), 1);
        assert!(align::verify_alignment(&signed, &engineer.config().align)
            .unwrap()
            .is_empty());

        let info = engineer.get_info(&signed).unwrap();
        assert_eq!(info.package.as_deref(), Some("com.new.app"));
        assert_eq!(info.app_name.as_deref(), Some("New App"));

        let mut archive = ZipArchive::new(File::open(&signed).unwrap()).unwrap();
        let mut strings = String::new();
        std::io::Read::read_to_string(
            &mut archive.by_name("res/values/strings.xml").unwrap(),
            &mut strings,
        )
        .unwrap();
        assert!(strings.contains("New App"), "{}", strings);

        // only the final output is left next to it
        let outputs: Vec<_> = fs::read_dir(dir.path().join("out")).unwrap().collect();
        assert_eq!(outputs.len(), 1);

        engineer.cleanup().unwrap();
        assert!(!dir.path().join("work").exists());
    }

    #[test]
    fn should_drop_v1_signature_files_when_re_signing() {
        let dir = tempfile::tempdir().unwrap();
        let engineer = engineer(dir.path());
        let apk = dir.path().join("signed-v1.apk");
        write_apk(
            &apk,
            &[
                (MANIFEST_NAME, sample_manifest("com.old.app", None)),
                ("META-INF/CERT.RSA", b"rsa".to_vec()),
                ("META-INF/CERT.SF", b"Signature-Version: 1.0".to_vec()),
                ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0".to_vec()),
                ("META-INF/services/a.b.Service", b"a.b.Impl".to_vec()),
                ("resources.arsc", sample_table("Old App")),
            ],
        );
        let job = Job {
            source: apk,
            output: dir.path().join("out/signed.apk"),
            package_name: None,
            app_name: None,
            icon: None,
            credentials: Some(credentials("bar")),
        };
        let signed = engineer.run(&job).unwrap();
        assert_eq!(engineer.verify(&signed).unwrap().len(), 1);

        let archive = ZipArchive::new(File::open(&signed).unwrap()).unwrap();
        let names: Vec<_> = archive.file_names().collect();
        assert!(names.contains(&"META-INF/services/a.b.Service"), "{:?}", names);
        assert!(!names.iter().any(|name| assemble::is_v1_signature_file(name)), "{:?}", names);
    }

    #[test]
    fn should_repackage_without_signing() {
        let dir = tempfile::tempdir().unwrap();
        let engineer = engineer(dir.path());
        let working_dir = engineer.extract(&source_apk(dir.path(), Some("Literal"))).unwrap();
        assert_eq!(working_dir, dir.path().join("work/source"));

        let out = dir.path().join("unsigned.apk");
        let entries = engineer.repackage(&working_dir, &out).unwrap();
        assert_eq!(entries.len(), 6);
        assert!(align::verify_alignment(&out, &engineer.config().align)
            .unwrap()
            .is_empty());
        assert!(engineer.verify(&out).is_err());
    }

    #[test]
    fn should_fall_back_to_strings_without_a_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let engineer = engineer(dir.path());
        let working_dir = engineer.extract(&source_apk(dir.path(), None)).unwrap();
        fs::remove_file(working_dir.join(MANIFEST_NAME)).unwrap();
        let patch = engineer.patch_app_name(&working_dir, "Fallback").unwrap();
        assert_eq!(patch, AppNamePatch::Strings(1));
    }

    #[test]
    fn should_keep_literal_labels_in_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let engineer = engineer(dir.path());
        let working_dir = engineer.extract(&source_apk(dir.path(), Some("Old"))).unwrap();
        let patch = engineer.patch_app_name(&working_dir, "New").unwrap();
        assert_eq!(
            patch,
            AppNamePatch::Manifest {
                previous: Some(AttrValue::Literal("Old".to_string())),
                strings_updated: 0,
            }
        );
        let doc = Document::parse(&fs::read(working_dir.join(MANIFEST_NAME)).unwrap()).unwrap();
        assert_eq!(
            manifest::label(&doc),
            Some(&AttrValue::Literal("New".to_string()))
        );
    }

    #[test]
    fn should_report_signing_failures() {
        let dir = tempfile::tempdir().unwrap();
        let engineer = engineer(dir.path());
        let unsigned = dir.path().join("unsigned.apk");
        write_apk(&unsigned, &[("a.txt", b"a".to_vec())]);
        let garbage = dir.path().join("garbage.keystore");
        fs::write(&garbage, b"garbage").unwrap();

        let outcome = Outcome::from(engineer.sign(
            &unsigned,
            &garbage,
            "pass",
            "alias",
            "pass",
            &dir.path().join("signed.apk"),
        ));
        assert!(!outcome.success);
        let message = outcome.message.unwrap();
        assert!(message.contains("PKCS12") && message.contains("JKS"), "{}", message);

        let missing = engineer.sign(
            &dir.path().join("nope.apk"),
            &garbage,
            "pass",
            "alias",
            "pass",
            &dir.path().join("signed.apk"),
        );
        assert!(matches!(missing, Err(SigningError::InputMissing(_))));
    }

    #[test]
    fn should_sign_with_pkcs12() {
        let dir = tempfile::tempdir().unwrap();
        let engineer = engineer(dir.path());
        let unsigned = dir.path().join("unsigned.apk");
        write_apk(&unsigned, &[("a.txt", b"a".to_vec())]);
        let out = dir.path().join("signed.apk");
        engineer
            .sign(
                &unsigned,
                &Path::new(TESTDATA).join("release.p12"),
                "storepass",
                "release",
                "",
                &out,
            )
            .unwrap();
        assert_eq!(engineer.verify(&out).unwrap().len(), 1);
    }

    #[test]
    fn should_reject_a_min_sdk_below_v2() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.signing.min_sdk_version = 21;
        let engineer = ApkReverseEngineer::new(config);
        let err = engineer
            .sign(
                &dir.path().join("a.apk"),
                &dir.path().join("k.jks"),
                "",
                "",
                "",
                &dir.path().join("b.apk"),
            )
            .unwrap_err();
        assert!(matches!(err, SigningError::MinSdkTooLow(21)));
    }

    #[test]
    fn should_stop_a_cancelled_run() {
        let dir = tempfile::tempdir().unwrap();
        let engineer = engineer(dir.path());
        engineer.cancel_token().cancel();
        let job = Job {
            source: source_apk(dir.path(), None),
            output: dir.path().join("out.apk"),
            package_name: None,
            app_name: None,
            icon: None,
            credentials: None,
        };
        assert!(matches!(engineer.run(&job), Err(PipelineError::Cancelled)));
        assert!(!dir.path().join("out.apk").exists());
    }
}
