use crate::error::PipelineError;
use crate::services::traits::ArtifactSink;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use zip::CompressionMethod;
use zip::write::FileOptions;

/// Writes each artifact as a file in one run's output directory.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArtifactSink for DirectorySink {
    fn save(&self, filename: &str, bytes: &[u8]) -> Result<(), PipelineError> {
        let path = self.dir.join(filename);
        fs::write(&path, bytes)?;
        info!("Wrote {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }
}

/// Zip every regular file in `dir`, sorted by name.
pub fn bundle_directory(dir: &Path) -> Result<Vec<u8>, PipelineError> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for path in entries {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        zip.start_file(name, options)
            .map_err(|e| PipelineError::Render(format!("zip error: {e}")))?;
        zip.write_all(&fs::read(&path)?)?;
    }
    let cursor = zip
        .finish()
        .map_err(|e| PipelineError::Render(format!("zip error: {e}")))?;
    Ok(cursor.into_inner())
}
