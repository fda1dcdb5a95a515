//! Random-access byte sources for program data.
//!
//! A [`DataLoader`] serves `(offset, len)` reads from an in-memory buffer, a
//! file, or (with the `mmap` feature) a memory-mapped file whose pages can be
//! locked into RAM.

use std::borrow::Cow;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::{EdgeError, Result};

pub trait DataLoader: Send + Sync {
    /// Read `len` bytes starting at `offset`.
    fn read(&self, offset: usize, len: usize) -> Result<Cow<'_, [u8]>>;

    /// Total size of the source in bytes.
    fn size(&self) -> usize;
}

fn check_range(offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(EdgeError::invalid(format!(
            "read of {} bytes at offset {} exceeds source of {} bytes",
            len, offset, size
        ))),
    }
}

/// Loader over bytes already in memory.
#[derive(Debug, Clone)]
pub struct BufferDataLoader {
    data: Vec<u8>,
}

impl BufferDataLoader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl DataLoader for BufferDataLoader {
    fn read(&self, offset: usize, len: usize) -> Result<Cow<'_, [u8]>> {
        check_range(offset, len, self.data.len())?;
        Ok(Cow::Borrowed(&self.data[offset..offset + len]))
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}

/// Loader that seeks and reads a file on every request.
#[derive(Debug)]
pub struct FileDataLoader {
    file: Mutex<File>,
    size: usize,
    path: PathBuf,
}

impl FileDataLoader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len() as usize;
        debug!(path = %path.display(), size, "opened program file");
        Ok(Self { file: Mutex::new(file), size, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataLoader for FileDataLoader {
    fn read(&self, offset: usize, len: usize) -> Result<Cow<'_, [u8]>> {
        check_range(offset, len, self.size)?;
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(&mut buf)?;
        Ok(Cow::Owned(buf))
    }

    fn size(&self) -> usize {
        self.size
    }
}

#[cfg(feature = "mmap")]
pub use self::mmap::{MlockConfig, MmapDataLoader};

#[cfg(feature = "mmap")]
mod mmap {
    use super::*;

    use memmap2::Mmap;
    use serde::{Deserialize, Serialize};
    use tracing::warn;

    /// Whether mapped pages are locked into physical memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum MlockConfig {
        #[default]
        NoMlock,
        /// Lock pages; failure to lock fails the open.
        UseMlock,
        /// Lock pages; failure to lock is logged and ignored.
        UseMlockIgnoreErrors,
    }

    /// Loader over a read-only memory map of a file.
    #[derive(Debug)]
    pub struct MmapDataLoader {
        mmap: Mmap,
        path: PathBuf,
        locked: bool,
    }

    impl MmapDataLoader {
        pub fn open(path: impl AsRef<Path>, mlock: MlockConfig) -> Result<Self> {
            let path = path.as_ref().to_path_buf();
            let file = File::open(&path)?;
            // SAFETY: the map is read-only; callers must not truncate the
            // program file while it is loaded.
            let mmap = unsafe { Mmap::map(&file)? };

            let locked = match mlock {
                MlockConfig::NoMlock => false,
                MlockConfig::UseMlock => {
                    lock_pages(&mmap)?;
                    true
                }
                MlockConfig::UseMlockIgnoreErrors => match lock_pages(&mmap) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "mlock failed; continuing unlocked");
                        false
                    }
                },
            };
            debug!(path = %path.display(), size = mmap.len(), locked, "mapped program file");
            Ok(Self { mmap, path, locked })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub fn is_locked(&self) -> bool {
            self.locked
        }
    }

    #[cfg(unix)]
    fn lock_pages(mmap: &Mmap) -> Result<()> {
        if mmap.is_empty() {
            return Ok(());
        }
        mmap.lock().map_err(EdgeError::from)
    }

    #[cfg(not(unix))]
    fn lock_pages(_: &Mmap) -> Result<()> {
        Err(EdgeError::NotSupported("mlock on this platform".into()))
    }

    impl DataLoader for MmapDataLoader {
        fn read(&self, offset: usize, len: usize) -> Result<Cow<'_, [u8]>> {
            check_range(offset, len, self.mmap.len())?;
            Ok(Cow::Borrowed(&self.mmap[offset..offset + len]))
        }

        fn size(&self) -> usize {
            self.mmap.len()
        }
    }
}
