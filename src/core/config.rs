use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the directory created under the system temp dir for working trees.
pub const WORK_ROOT_NAME: &str = "apk_reverse_temp";

pub const KNOWN_ICON_FILES: [&str; 6] = ["yn.png", "N3.png", "9w.png", "FS.png", "RJ.png", "o-.png"];

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct PipelineConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub align: AlignConfig,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub icon: IconConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

fn default_root() -> PathBuf {
    std::env::temp_dir().join(WORK_ROOT_NAME)
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AlignConfig {
    #[serde(default = "default_alignment")]
    pub alignment: u64,
    /// Applied to `.so` entries so they can be mapped straight from the APK.
    #[serde(default = "default_native_lib_alignment")]
    pub native_lib_alignment: u64,
}

fn default_alignment() -> u64 {
    4
}

fn default_native_lib_alignment() -> u64 {
    16384
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            alignment: default_alignment(),
            native_lib_alignment: default_native_lib_alignment(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SigningConfig {
    #[serde(default = "default_min_sdk_version")]
    pub min_sdk_version: u32,
}

fn default_min_sdk_version() -> u32 {
    26
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            min_sdk_version: default_min_sdk_version(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct IconConfig {
    #[serde(default = "default_known_files")]
    pub known_files: Vec<String>,
    /// Also replace the bitmaps the manifest's icon attributes point to.
    #[serde(default = "default_discover")]
    pub discover: bool,
}

fn default_known_files() -> Vec<String> {
    KNOWN_ICON_FILES.iter().map(|name| name.to_string()).collect()
}

fn default_discover() -> bool {
    true
}

impl Default for IconConfig {
    fn default() -> Self {
        Self {
            known_files: default_known_files(),
            discover: default_discover(),
        }
    }
}

/// Deserializes one top-level group. A missing or malformed group gives its
/// defaults without affecting the other groups.
fn parse_group<T: DeserializeOwned + Default>(table: &toml::Table, name: &str) -> T {
    let Some(value) = table.get(name) else {
        return T::default();
    };
    match value.clone().try_into::<T>() {
        Ok(group) => group,
        Err(err) => {
            log::warn!("Ignoring malformed [{}] config: {}", name, err);
            T::default()
        }
    }
}

pub fn parse_config_str(content: &str) -> PipelineConfig {
    match content.parse::<toml::Table>() {
        Ok(table) => PipelineConfig {
            workspace: parse_group(&table, "workspace"),
            align: parse_group(&table, "align"),
            signing: parse_group(&table, "signing"),
            icon: parse_group(&table, "icon"),
        },
        Err(err) => {
            // Config malformed, use the default config and the user can fix it
            log::warn!("Ignoring malformed config: {}", err);
            PipelineConfig::default()
        }
    }
}

/// Reads the config at `path`. A missing file gives the defaults.
pub fn parse_config(path: &Path) -> PipelineConfig {
    match fs::read_to_string(path) {
        Ok(content) => parse_config_str(&content),
        Err(err) => {
            log::debug!("No config at {}: {}", path.display(), err);
            PipelineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn with_config_file(content: &str, f: impl Fn(&Path)) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("subpack.toml");
        fs::write(&path, content).unwrap();
        f(&path)
    }

    #[test]
    fn should_read_every_group() {
        with_config_file(
            r#"
                [workspace]
                root = "/srv/work"

                [align]
                alignment = 8
                native_lib_alignment = 4096

                [signing]
                min_sdk_version = 28

                [icon]
                known_files = ["a.png"]
                discover = false
            "#,
            |path| {
                let config = parse_config(path);
                assert_eq!(config.workspace.root, PathBuf::from("/srv/work"));
                assert_eq!(config.align.alignment, 8);
                assert_eq!(config.align.native_lib_alignment, 4096);
                assert_eq!(config.signing.min_sdk_version, 28);
                assert_eq!(config.icon.known_files, vec!["a.png".to_string()]);
                assert!(!config.icon.discover);
            },
        );
    }

    #[test]
    fn should_default_missing_groups_and_keys() {
        with_config_file(
            r#"
                [align]
                alignment = 16
            "#,
            |path| {
                let config = parse_config(path);
                assert_eq!(config.align.alignment, 16);
                assert_eq!(config.align.native_lib_alignment, 16384);
                assert_eq!(config.signing.min_sdk_version, 26);
                assert_eq!(config.icon.known_files.len(), 6);
                assert!(config.icon.discover);
                assert!(config.workspace.root.ends_with(WORK_ROOT_NAME));
            },
        );
    }

    #[test]
    fn should_fall_back_per_group() {
        with_config_file(
            r#"
                [align]
                alignment = "wide"

                [signing]
                min_sdk_version = 28
            "#,
            |path| {
                let config = parse_config(path);
                assert_eq!(config.align, AlignConfig::default());
                assert_eq!(config.signing.min_sdk_version, 28);
            },
        );
    }

    #[test]
    fn should_fall_back_to_defaults_when_malformed() {
        with_config_file("[align\nalignment = ", |path| {
            let config = parse_config(path);
            assert_eq!(config.align, AlignConfig::default());
        });
        let config = parse_config(Path::new("/nonexistent/subpack.toml"));
        assert_eq!(config.signing, SigningConfig::default());
    }
}
