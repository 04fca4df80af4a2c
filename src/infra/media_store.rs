use crate::error::{IngestError, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Downloaded media files, addressed by paths relative to `<data_root>/raw/media`.
///
/// Relative paths are what records carry in `media_path`, so the data root can move.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn at_data_root<P: AsRef<Path>>(data_root: P) -> Self {
        Self::new(data_root.as_ref().join("raw").join("media"))
    }

    /// `<channel>/<YYYY-MM-DD>/<id>_<unix ts>.<ext>`
    pub fn relative_path(
        channel: &str,
        external_id: i64,
        posted_at: DateTime<Utc>,
        kind: &str,
        mime_type: Option<&str>,
    ) -> String {
        format!(
            "{}/{}/{}_{}.{}",
            channel,
            posted_at.format("%Y-%m-%d"),
            external_id,
            posted_at.timestamp(),
            extension_for(kind, mime_type)
        )
    }

    /// Absolute location of a stored media path; refuses paths that escape the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let rel = Path::new(relative);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.is_empty() {
            return Err(IngestError::Config(format!(
                "media path {relative} is outside the media root"
            )));
        }
        Ok(self.root.join(rel))
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.resolve(relative)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Write media bytes via temp file and rename so a crash never leaves a partial image.
    pub fn store(&self, relative: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(relative)?;
        let dir = path
            .parent()
            .ok_or_else(|| IngestError::Config(format!("bad media path {relative}")))?;
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| IngestError::Io(e.error))?;
        debug!("Stored {} bytes of media at {}", bytes.len(), relative);
        Ok(())
    }
}

fn extension_for(kind: &str, mime_type: Option<&str>) -> &'static str {
    match mime_type {
        Some("image/jpeg") | Some("image/jpg") => return "jpg",
        Some("image/png") => return "png",
        Some("image/webp") => return "webp",
        Some(m) if m.starts_with("video/") => return "mp4",
        Some("application/pdf") => return "pdf",
        _ => {}
    }
    match kind {
        "photo" => "jpg",
        _ => "bin",
    }
}
