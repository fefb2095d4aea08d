//! Archive the result and log files of a run.

use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::ExportError;

/// Extensions that make it into the archive.
pub const EXPORTED_EXTENSIONS: [&str; 2] = ["json", "log"];

fn is_exported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXPORTED_EXTENSIONS.contains(&ext))
}

/// Zip every `*.json` and `*.log` below `rundir` into `archive`, keeping
/// paths relative to `rundir`. Returns the archived entries.
pub fn export_results(rundir: &Path, archive: &Path) -> Result<Vec<PathBuf>, ExportError> {
    if !rundir.is_dir() {
        return Err(ExportError::MissingDirectory {
            path: rundir.to_path_buf(),
        });
    }
    info!(rundir = %rundir.display(), archive = %archive.display(), "Exporting results");

    let file = std::fs::File::create(archive)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut entries = Vec::new();
    for entry in WalkDir::new(rundir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() || !is_exported(path) || path == archive {
            continue;
        }
        let Ok(relative) = path.strip_prefix(rundir) else {
            continue;
        };

        let name = relative.to_string_lossy().replace('\\', "/");
        zip.start_file(name.as_str(), options)?;
        zip.write_all(&std::fs::read(path)?)?;
        debug!(entry = %name, "Archived");
        entries.push(relative.to_path_buf());
    }

    zip.finish()?;
    info!(files = entries.len(), "Export finished");
    Ok(entries)
}
