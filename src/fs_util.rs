use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;
use zip::ZipArchive;

use crate::error::WorkerError;

/// Creates `path` if missing. Returns whether a directory was already there.
pub fn create_directory(path: &Path) -> Result<bool, WorkerError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => return Ok(true),
        Ok(_) => {
            return Err(WorkerError::Filesystem(format!(
                "{} exists and is not a directory",
                path.display()
            )));
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(WorkerError::Filesystem(format!(
                "stat {}: {err}",
                path.display()
            )));
        }
    }
    fs::create_dir_all(path)
        .map_err(|err| WorkerError::Filesystem(format!("create {}: {err}", path.display())))?;
    Ok(false)
}

/// Removes everything under `path`, leaving an empty directory behind.
pub fn clear_directory(path: &Path) -> Result<(), WorkerError> {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(WorkerError::Filesystem(format!(
                "remove {}: {err}",
                path.display()
            )));
        }
    }
    fs::create_dir_all(path)
        .map_err(|err| WorkerError::Filesystem(format!("create {}: {err}", path.display())))
}

/// Creates the directory when absent and empties it when present.
pub fn prepare_directory(path: &Path) -> Result<(), WorkerError> {
    if create_directory(path)? {
        clear_directory(path)?;
    }
    Ok(())
}

/// Sum of file sizes below `root`. Symlinks are counted by their own size
/// and never followed.
pub fn directory_size(root: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(root)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub skipped: usize,
}

/// Unpacks `zip_path` into `target_dir`, overwriting existing files.
///
/// Only an unreadable archive is an error. Entries that cannot be read or
/// written are logged and skipped so the rest of the bundle still lands.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<ExtractSummary, WorkerError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| WorkerError::Archive(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive = ZipArchive::new(file).map_err(|err| WorkerError::Archive(err.to_string()))?;

    let mut summary = ExtractSummary::default();
    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(index = i, error = %err, "skipping unreadable archive entry");
                summary.skipped += 1;
                continue;
            }
        };
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                warn!(name = entry.name(), "skipping archive entry outside target directory");
                summary.skipped += 1;
                continue;
            }
        };

        if entry.is_dir() {
            match fs::create_dir_all(&entry_path) {
                Ok(()) => summary.directories += 1,
                Err(err) => {
                    warn!(path = %entry_path.display(), error = %err, "failed to create directory");
                    summary.skipped += 1;
                }
            }
            continue;
        }

        let written = entry_path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::File::create(&entry_path))
            .and_then(|mut outfile| io::copy(&mut entry, &mut outfile));
        match written {
            Ok(_) => summary.files += 1,
            Err(err) => {
                warn!(path = %entry_path.display(), error = %err, "failed to extract file");
                summary.skipped += 1;
            }
        }
    }
    Ok(summary)
}
