//! Crash-safe file writes: temp file in the target directory, fsync, rename.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::{Builder, NamedTempFile};

pub(crate) const TEMP_PREFIX: &str = ".loracam-";
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

/// Published files are read by the reporting layer, which may run as
/// another user.
#[cfg(unix)]
const PUBLISHED_MODE: u32 = 0o644;

fn parent_dir(path: &Path) -> io::Result<&Path> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent),
        Some(_) => Ok(Path::new(".")),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path has no parent directory",
        )),
    }
}

/// Write `content` into a hidden temp file next to `path` and flush it to
/// disk. The file never matches an image extension.
fn staged(dir: &Path, content: &[u8]) -> io::Result<NamedTempFile> {
    let mut builder = Builder::new();
    builder.prefix(TEMP_PREFIX).suffix(TEMP_SUFFIX);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(PUBLISHED_MODE));
    }

    let mut temp = builder.tempfile_in(dir)?;
    temp.write_all(content)?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    Ok(temp)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Replace `path` with `content` so readers see either the old or the new
/// file, never a partial one.
pub fn atomic_replace(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path)?;
    fs::create_dir_all(dir)?;

    let temp = staged(dir, content)?;
    temp.persist(path).map_err(|err| err.error)?;
    sync_dir(dir);
    Ok(())
}

/// Write `content` under the first free name produced by `candidate(0)`,
/// `candidate(1)`, ... without ever replacing an existing file.
///
/// Returns the path that was written.
pub fn write_new<F>(dir: &Path, content: &[u8], mut candidate: F) -> io::Result<PathBuf>
where
    F: FnMut(u32) -> String,
{
    fs::create_dir_all(dir)?;
    let mut temp = staged(dir, content)?;

    for attempt in 0..1000 {
        let target = dir.join(candidate(attempt));
        match temp.persist_noclobber(&target) {
            Ok(_) => {
                sync_dir(dir);
                return Ok(target);
            }
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                temp = err.file;
            }
            Err(err) => return Err(err.error),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no free file name after 1000 attempts",
    ))
}

/// Remove temp files left behind by an interrupted write. Returns how many
/// were removed.
pub fn sweep_stale(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}
