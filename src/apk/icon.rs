//! Launcher icon substitution inside a working tree.
use super::manifest::{self, ANDROID_NS};
use super::extract;
use super::table::Table;
use super::MANIFEST_NAME;
use crate::core::config::IconConfig;
use crate::core::error::PipelineError;
use crate::core::workspace::CancelToken;
use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::io::Reader as ImageReader;
use image::{DynamicImage, ImageOutputFormat};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IconFormat {
    Png,
    Webp,
    Jpeg,
}

impl IconFormat {
    /// Encoding for a file being overwritten. Unknown extensions get PNG.
    pub fn for_path(path: &Path) -> Self {
        match extension(path).as_deref() {
            Some("webp") => Self::Webp,
            Some("jpg") | Some("jpeg") => Self::Jpeg,
            _ => Self::Png,
        }
    }

    /// Only plain bitmaps can be replaced; nine-patches and XML drawables
    /// cannot.
    pub fn is_replaceable(path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        !name.ends_with(".9.png")
            && matches!(
                extension(path).as_deref(),
                Some("png") | Some("webp") | Some("jpg") | Some("jpeg")
            )
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// Edge length for a replacement icon, guessed from the size of the file
/// it replaces.
pub fn size_class(file_len: u64) -> u32 {
    match file_len {
        len if len > 40000 => 192,
        len if len > 20000 => 144,
        len if len > 10000 => 96,
        len if len > 5000 => 72,
        _ => 48,
    }
}

pub struct Scaler {
    img: DynamicImage,
}

impl Scaler {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let img = ImageReader::open(path)
            .with_context(|| format!("Scaler failed to open image at `{}`", path.display()))?
            .with_guessed_format()?
            .decode()?;
        Ok(Self { img })
    }

    pub fn write<W: Write + Seek>(
        &self,
        w: &mut W,
        width: u32,
        height: u32,
        format: IconFormat,
    ) -> Result<()> {
        let resized = self.img.resize_exact(width, height, FilterType::Lanczos3);
        match format {
            IconFormat::Png => resized.write_to(w, ImageOutputFormat::Png)?,
            IconFormat::Webp => {
                DynamicImage::ImageRgba8(resized.to_rgba8()).write_to(w, ImageOutputFormat::WebP)?
            }
            IconFormat::Jpeg => {
                DynamicImage::ImageRgb8(resized.to_rgb8()).write_to(w, ImageOutputFormat::Jpeg(100))?
            }
        }
        Ok(())
    }

    /// Overwrites `target` with the scaled image in `target`'s own format.
    pub fn replace(&self, target: &Path, width: u32, height: u32) -> Result<()> {
        // Encode fully before truncating the original.
        let mut encoded = std::io::Cursor::new(vec![]);
        self.write(&mut encoded, width, height, IconFormat::for_path(target))?;
        let mut out = BufWriter::new(File::create(target)?);
        out.write_all(encoded.get_ref())?;
        out.flush()?;
        Ok(())
    }
}

/// How a target gets sized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Sizing {
    /// Known file names: size class from the file length.
    FileLength,
    /// Discovered through the manifest: keep the bitmap's dimensions.
    Dimensions,
}

/// Known icon names sitting directly under `res`.
fn known_files(res: &Path, known: &[String]) -> Vec<PathBuf> {
    known
        .iter()
        .map(|name| res.join(name))
        .filter(|path| path.is_file())
        .collect()
}

/// Bitmaps the manifest's `icon` and `roundIcon` resolve to.
fn discover_icon_files(working_dir: &Path) -> Result<Vec<PathBuf>> {
    let doc = manifest::read_manifest(&working_dir.join(MANIFEST_NAME))?;
    let application = manifest::application(&doc)?;
    let Some(table) = Table::from_dir(working_dir)? else {
        return Ok(vec![]);
    };
    let mut files = vec![];
    if let Some(element) = doc.element(application) {
        for name in ["icon", "roundIcon"] {
            let Some(id) = element
                .attribute(Some(ANDROID_NS), name)
                .and_then(|attr| attr.value.reference())
            else {
                continue;
            };
            for file in table.resolve_files(id) {
                let path = match extract::entry_path(&file) {
                    Ok(relative) => working_dir.join(relative),
                    Err(err) => {
                        log::warn!("Ignoring {} for {}: {}", file, name, err);
                        continue;
                    }
                };
                if !path.is_file() {
                    log::debug!("{} for {} is not in the working tree", file, name);
                } else if !IconFormat::is_replaceable(&path) {
                    log::debug!("Skipping non-bitmap icon {}", file);
                } else {
                    files.push(path);
                }
            }
        }
    }
    Ok(files)
}

fn target_size(path: &Path, sizing: Sizing) -> Result<(u32, u32)> {
    if sizing == Sizing::Dimensions {
        match image::image_dimensions(path) {
            Ok(dimensions) => return Ok(dimensions),
            Err(err) => log::debug!("Cannot read {}: {}", path.display(), err),
        }
    }
    let size = size_class(fs::metadata(path)?.len());
    Ok((size, size))
}

/// Replaces icon bitmaps under `working_dir` with `image`. Returns the number
/// of files replaced; zero means nothing matched.
pub fn substitute_icons(
    working_dir: &Path,
    image: &Path,
    config: &IconConfig,
    cancel: &CancelToken,
) -> Result<usize, PipelineError> {
    let res = working_dir.join("res");
    if !res.is_dir() {
        log::warn!("No res directory in {}", working_dir.display());
        return Ok(0);
    }
    let scaler = Scaler::open(image).map_err(|e| PipelineError::Icon(format!("{:#}", e)))?;

    let mut targets: BTreeMap<PathBuf, Sizing> = BTreeMap::new();
    for path in known_files(&res, &config.known_files) {
        targets.insert(path, Sizing::FileLength);
    }
    if config.discover {
        match discover_icon_files(working_dir) {
            Ok(paths) => {
                for path in paths {
                    targets.entry(path).or_insert(Sizing::Dimensions);
                }
            }
            Err(err) => log::warn!("Icon discovery failed: {:#}", err),
        }
    }

    let mut replaced = 0;
    for (path, sizing) in targets {
        cancel.check()?;
        let result =
            target_size(&path, sizing).and_then(|(w, h)| scaler.replace(&path, w, h).map(|_| (w, h)));
        match result {
            Ok((w, h)) => {
                log::debug!("Replaced {} at {}x{}", path.display(), w, h);
                replaced += 1;
            }
            Err(err) => log::warn!("Failed to replace {}: {:#}", path.display(), err),
        }
    }
    log::info!("Replaced {} icon files", replaced);
    Ok(replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::testutil::{png_bytes, sample_manifest, sample_table, sample_table_with_icons};

    fn source_icon(dir: &Path) -> PathBuf {
        let path = dir.join("new.png");
        fs::write(&path, png_bytes(256, 256)).unwrap();
        path
    }

    #[test]
    fn should_pick_size_classes_from_file_length() {
        assert_eq!(size_class(40001), 192);
        assert_eq!(size_class(40000), 144);
        assert_eq!(size_class(20001), 144);
        assert_eq!(size_class(10001), 96);
        assert_eq!(size_class(5001), 72);
        assert_eq!(size_class(5000), 48);
        assert_eq!(size_class(0), 48);
    }

    #[test]
    fn should_replace_known_icon_files() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(work.join("res")).unwrap();
        fs::write(work.join("res/yn.png"), vec![0u8; 6000]).unwrap();
        fs::write(work.join("res/N3.png"), vec![0u8; 100]).unwrap();
        fs::write(work.join("res/other.png"), b"untouched").unwrap();

        let config = IconConfig {
            discover: false,
            ..Default::default()
        };
        let replaced =
            substitute_icons(&work, &source_icon(dir.path()), &config, &CancelToken::new()).unwrap();
        assert_eq!(replaced, 2);
        assert_eq!(image::image_dimensions(work.join("res/yn.png")).unwrap(), (72, 72));
        assert_eq!(image::image_dimensions(work.join("res/N3.png")).unwrap(), (48, 48));
        assert_eq!(fs::read(work.join("res/other.png")).unwrap(), b"untouched");
    }

    #[test]
    fn should_leave_nested_files_with_known_names() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(work.join("res/drawable-xxhdpi")).unwrap();
        let nested = work.join("res/drawable-xxhdpi/yn.png");
        fs::write(&nested, png_bytes(10, 3)).unwrap();
        fs::write(work.join("res/RJ.png"), vec![0u8; 100]).unwrap();

        let config = IconConfig {
            discover: false,
            ..Default::default()
        };
        let replaced =
            substitute_icons(&work, &source_icon(dir.path()), &config, &CancelToken::new()).unwrap();
        assert_eq!(replaced, 1);
        assert_eq!(image::image_dimensions(&nested).unwrap(), (10, 3));
        assert_eq!(image::image_dimensions(work.join("res/RJ.png")).unwrap(), (48, 48));
    }

    #[test]
    fn should_keep_the_target_format() {
        let dir = tempfile::tempdir().unwrap();
        let scaler = Scaler::open(source_icon(dir.path())).unwrap();
        let jpeg = dir.path().join("icon.jpg");
        fs::write(&jpeg, b"x").unwrap();
        scaler.replace(&jpeg, 48, 48).unwrap();
        assert_eq!(
            image::ImageFormat::from_path(&jpeg).unwrap(),
            image::ImageFormat::Jpeg
        );
        let bytes = fs::read(&jpeg).unwrap();
        assert_eq!(&bytes[..2], &[0xff, 0xd8]);

        let webp = dir.path().join("icon.webp");
        scaler.replace(&webp, 32, 32).unwrap();
        assert_eq!(&fs::read(&webp).unwrap()[8..12], b"WEBP");
    }

    #[test]
    fn should_discover_icons_through_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(work.join("res/mipmap-mdpi")).unwrap();
        fs::create_dir_all(work.join("res/mipmap-xxhdpi")).unwrap();
        fs::write(work.join(MANIFEST_NAME), sample_manifest("com.old.app", None)).unwrap();
        fs::write(work.join("resources.arsc"), sample_table("Old")).unwrap();
        fs::write(work.join("res/mipmap-mdpi/ic_launcher.png"), png_bytes(48, 48)).unwrap();
        // listed in the table but missing from the tree
        let replaced = substitute_icons(
            &work,
            &source_icon(dir.path()),
            &IconConfig::default(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(replaced, 1);
        assert_eq!(
            image::image_dimensions(work.join("res/mipmap-mdpi/ic_launcher.png")).unwrap(),
            (48, 48)
        );
    }

    #[test]
    fn should_ignore_table_paths_leaving_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(work.join("res/mipmap-xxhdpi")).unwrap();
        fs::write(work.join(MANIFEST_NAME), sample_manifest("com.old.app", None)).unwrap();
        fs::write(
            work.join("resources.arsc"),
            sample_table_with_icons("Old", "res/../../victim.png", "res/mipmap-xxhdpi/a.png"),
        )
        .unwrap();
        let victim = dir.path().join("victim.png");
        let original = png_bytes(300, 100);
        fs::write(&victim, &original).unwrap();

        let replaced = substitute_icons(
            &work,
            &source_icon(dir.path()),
            &IconConfig::default(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(replaced, 0);
        assert_eq!(fs::read(&victim).unwrap(), original);
    }

    #[test]
    fn should_be_a_no_op_without_matches() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(work.join("res/drawable")).unwrap();
        let replaced = substitute_icons(
            &work,
            &source_icon(dir.path()),
            &IconConfig::default(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(replaced, 0);
    }

    #[test]
    fn should_skip_nine_patches_and_xml() {
        assert!(IconFormat::is_replaceable(Path::new("res/a/ic.png")));
        assert!(IconFormat::is_replaceable(Path::new("res/a/ic.WEBP")));
        assert!(!IconFormat::is_replaceable(Path::new("res/a/ic.9.png")));
        assert!(!IconFormat::is_replaceable(Path::new("res/a/ic_launcher.xml")));
    }
}
