//! External VFS interface (§6): the core "neither opens nor resolves paths" — it consumes an
//! already-opened file handle plus `(base_offset, base_size, sector_size, file_hints)`. This
//! module defines that boundary as a trait, grounded in `image_store::ImageStore`'s
//! trait-plus-`fs` submodule shape, so a host application can plug in its own mount/resolution
//! layer (archive-backed, network-backed, ...) without the loader knowing the difference.

use std::os::unix::io::RawFd;
use crate::types::FileHints;

/// A source file as handed back by the VFS layer (§6): an opaque handle plus the geometry the
/// AIO/PIO drivers need to read it.
#[derive(Debug, Clone, Copy)]
pub struct OpenedFile {
    pub file_handle: RawFd,
    pub base_offset: u64,
    pub base_size: u64,
    pub sector_size: u64,
    pub file_hints: FileHints,
}

/// Resolves a loader's `file_path` to an [`OpenedFile`]. The loader calls this once per load
/// request; everything downstream only ever sees the returned handle and geometry.
pub trait VfsSource: Send + Sync {
    fn open(&self, path: &str) -> std::io::Result<OpenedFile>;
}

/// A plain-filesystem [`VfsSource`], sufficient for a host with no archive/mount layer of its
/// own and for exercising the loader/cache pipeline in tests against real files.
pub struct FsVfs {
    pub sector_size: u64,
    pub file_hints: FileHints,
}

impl FsVfs {
    pub fn new(sector_size: u64) -> Self {
        Self { sector_size, file_hints: FileHints::NONE }
    }
}

impl Default for FsVfs {
    fn default() -> Self {
        Self::new(512)
    }
}

impl VfsSource for FsVfs {
    fn open(&self, path: &str) -> std::io::Result<OpenedFile> {
        use std::os::unix::io::IntoRawFd;
        let file = std::fs::File::open(path)?;
        let base_size = file.metadata()?.len();
        Ok(OpenedFile {
            file_handle: file.into_raw_fd(),
            base_offset: 0,
            base_size,
            sector_size: self.sector_size,
            file_hints: self.file_hints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn fs_vfs_opens_and_reports_size() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello world").unwrap();
        let vfs = FsVfs::default();
        let opened = vfs.open(tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(opened.base_size, 11);
        assert_eq!(opened.base_offset, 0);
        unsafe { libc::close(opened.file_handle) };
    }

    #[test]
    fn fs_vfs_reports_not_found() {
        let vfs = FsVfs::default();
        assert!(vfs.open("/nonexistent/path/for/fs-vfs-test").is_err());
    }
}
