use std::{
    ffi::OsString,
    fs::{self, File},
    os::unix::{
        ffi::{OsStrExt, OsStringExt},
        fs::PermissionsExt,
    },
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{event, instrument, Level};

/// Maximum length in bytes of a resolved path, longer URLs are truncated to fit.
pub const MAX_PATH_LEN: usize = 200;

const WORLD_READABLE: u32 = 0o004;

/// Directory files are served from.
#[derive(Debug, Clone)]
pub struct DocumentRoot {
    path: PathBuf,
}

impl DocumentRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a URL path to the root, truncating to `MAX_PATH_LEN`.
    ///
    /// Returns `None` if the truncated URL climbs above the root.
    pub fn join(&self, url: &str) -> Option<PathBuf> {
        let mut bytes = self.path.as_os_str().as_bytes().to_vec();
        let room = MAX_PATH_LEN.saturating_sub(bytes.len() + 1);
        let url = url.as_bytes();
        let url = &url[..url.len().min(room)];

        // Checked after truncating, cutting a segment short can turn it into `..`
        if escapes_root(url) {
            return None;
        }

        bytes.extend_from_slice(url);

        Some(PathBuf::from(OsString::from_vec(bytes)))
    }

    /// Resolve a URL to a file, and map it into memory.
    #[instrument("DocumentRoot::resolve", level = "debug", skip(self))]
    pub fn resolve(&self, url: &str) -> Result<MappedFile, ResolveError> {
        let path = self.join(url).ok_or(ResolveError::NotFound)?;

        let metadata = fs::metadata(&path).map_err(|_| ResolveError::NotFound)?;
        if metadata.permissions().mode() & WORLD_READABLE == 0 {
            return Err(ResolveError::Forbidden);
        }
        if metadata.is_dir() {
            return Err(ResolveError::Directory);
        }
        if !metadata.is_file() {
            return Err(ResolveError::Forbidden);
        }

        // Nothing to map
        if metadata.len() == 0 {
            return Ok(MappedFile { map: None });
        }

        let file = File::open(&path)?;
        // Private and read-only. The mapping stays valid after the file is closed.
        let map = unsafe { Mmap::map(&file)? };
        drop(file);

        event!(Level::TRACE, len = map.len(), "mapped file");

        Ok(MappedFile { map: Some(map) })
    }
}

/// Read-only memory mapping of a served file.
///
/// The mapping is released when this is dropped.
pub struct MappedFile {
    map: Option<Mmap>,
}

impl MappedFile {
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or_default()
    }
}

/// Failed to resolve a URL to a servable file.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("resource not found")]
    NotFound,
    #[error("resource is not world-readable")]
    Forbidden,
    #[error("resource is a directory")]
    Directory,
    #[error("failed to map resource")]
    Io(#[from] std::io::Error),
}

/// Returns true if the `..` segments of a URL climb above its root.
fn escapes_root(url: &[u8]) -> bool {
    let mut depth = 0usize;

    for segment in url.split(|byte| *byte == b'/') {
        match segment {
            b"" | b"." => {}
            b".." => match depth.checked_sub(1) {
                Some(value) => depth = value,
                None => return true,
            },
            _ => depth += 1,
        }
    }

    false
}
