use anyhow::{Context, Result};
use image::DynamicImage;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// A reference screen together with the tags that select it.
///
/// `match_level` is the minimum match percentage (0-100) the live frame has
/// to reach against the reference image.
#[derive(Debug, Clone)]
pub struct Needle {
    pub name: String,
    pub tags: Vec<String>,
    pub match_level: f64,
    pub image: DynamicImage,
}

impl Needle {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Source of the needle database. The engine reloads through this port on
/// demand; how needles are stored is the repo's business.
pub trait NeedleRepo {
    fn load(&self) -> Result<Vec<Arc<Needle>>>;
}

/// A fixed, in-memory needle list.
#[derive(Default)]
pub struct MemoryNeedles(pub Vec<Arc<Needle>>);

impl NeedleRepo for MemoryNeedles {
    fn load(&self) -> Result<Vec<Arc<Needle>>> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct NeedleMeta {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(rename = "match", default = "default_match_level")]
    match_level: f64,
}

fn default_match_level() -> f64 {
    96.0
}

/// Directory of `<name>.json` metadata files, each next to a `<name>.png`
/// reference image. Unreadable entries are skipped with a warning so one
/// broken needle does not take down a reload.
pub struct JsonNeedleDir {
    dir: PathBuf,
}

impl JsonNeedleDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl NeedleRepo for JsonNeedleDir {
    fn load(&self) -> Result<Vec<Arc<Needle>>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read needle dir: {}", self.dir.display()))?;

        let mut needles = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping unreadable needle dir entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let meta: NeedleMeta = match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
            {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(needle = name, "Skipping needle with bad metadata: {}", e);
                    continue;
                }
            };

            let image_path = path.with_extension("png");
            let image = match image::open(&image_path) {
                Ok(img) => img,
                Err(e) => {
                    warn!(needle = name, "Skipping needle with unreadable image: {}", e);
                    continue;
                }
            };

            needles.push(Arc::new(Needle {
                name: name.to_string(),
                tags: meta.tags,
                match_level: meta.match_level,
                image,
            }));
        }

        needles.sort_by(|a, b| a.name.cmp(&b.name));
        info!(count = needles.len(), dir = %self.dir.display(), "Needles loaded");
        Ok(needles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::TempDir;

    fn write_needle(dir: &std::path::Path, name: &str, json: &str) {
        fs::write(dir.join(format!("{name}.json")), json).unwrap();
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, image::Rgb([1, 2, 3])));
        img.save(dir.join(format!("{name}.png"))).unwrap();
    }

    #[test]
    fn loads_metadata_and_image() {
        let tmp = TempDir::new().unwrap();
        write_needle(tmp.path(), "login", r#"{"tags":["login","desktop"],"match":90.5}"#);

        let needles = JsonNeedleDir::new(tmp.path()).load().unwrap();
        assert_eq!(needles.len(), 1);
        assert_eq!(needles[0].name, "login");
        assert!(needles[0].has_tag("desktop"));
        assert_eq!(needles[0].match_level, 90.5);
        assert_eq!(needles[0].image.width(), 8);
    }

    #[test]
    fn match_level_defaults_when_absent() {
        let tmp = TempDir::new().unwrap();
        write_needle(tmp.path(), "plain", r#"{"tags":["t"]}"#);

        let needles = JsonNeedleDir::new(tmp.path()).load().unwrap();
        assert_eq!(needles[0].match_level, 96.0);
    }

    #[test]
    fn broken_entries_are_skipped() {
        let tmp = TempDir::new().unwrap();
        write_needle(tmp.path(), "good", r#"{"tags":["a"]}"#);
        fs::write(tmp.path().join("bad.json"), "not json").unwrap();
        // Metadata without an image is also skipped.
        fs::write(tmp.path().join("orphan.json"), r#"{"tags":["b"]}"#).unwrap();

        let needles = JsonNeedleDir::new(tmp.path()).load().unwrap();
        assert_eq!(needles.len(), 1);
        assert_eq!(needles[0].name, "good");
    }
}
