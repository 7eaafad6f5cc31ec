// Directory file creation/opening with header validation, mmap, and an
// advisory lock so an offline sweep never races a live process.
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::MmapMut;
use serde::Serialize;

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::{
    directory_header_size, offset_table_entry, slot_size, SlotBounds, DIRECTORY_HEADER_LEN,
    DIRECTORY_MAGIC, MAGIC_OFFSET, N_SLOTS_OFFSET,
};
use crate::core::region::Region;
use crate::core::slot::Slot;
use crate::core::sweep;

/// An open directory file. Holds an exclusive advisory lock for its
/// lifetime; dropping it releases the lock. Detach all slots before
/// dropping — attached slots keep the mapping alive through their own
/// `Arc`, but a still-locked file is what keeps a concurrent sweep out.
#[derive(Debug)]
pub struct Directory {
    path: PathBuf,
    file: File,
    region: Arc<Region>,
    n_slots: u64,
}

impl Directory {
    /// Creates and initializes a new directory file. Refuses to overwrite
    /// an existing path. The magic signature is written and persisted last,
    /// so a crash mid-creation leaves a file that `open` rejects.
    pub fn create(path: impl AsRef<Path>, size: u64, n_slots: u64) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let per_slot = slot_size(size, n_slots)?;

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::AlreadyExists => Error::new(ErrorKind::AlreadyExists)
                    .with_message("directory file already exists")
                    .with_path(&path),
                _ => Error::new(ErrorKind::Io).with_path(&path).with_source(err),
            })?;

        match Self::initialize(&path, file, size, n_slots, per_slot) {
            Ok(dir) => Ok(dir),
            Err(err) => {
                // The file carries no magic yet; remove the husk.
                let _ = fs::remove_file(&path);
                Err(err)
            }
        }
    }

    fn initialize(
        path: &Path,
        file: File,
        size: u64,
        n_slots: u64,
        per_slot: u64,
    ) -> Result<Self, Error> {
        file.set_len(size)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
        lock(&file, path)?;

        let map = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?
        };
        let region = Arc::new(Region::new(map));

        let header_size = directory_header_size(n_slots);
        let mut start = header_size;
        for index in 0..n_slots {
            unsafe {
                region
                    .u64_at(offset_table_entry(index))
                    .store(start, Ordering::Relaxed);
            }
            start += per_slot;
        }
        unsafe {
            region.u64_at(N_SLOTS_OFFSET).store(n_slots, Ordering::Relaxed);
        }
        region
            .persist(0, header_size)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;

        unsafe {
            region
                .u64_at(MAGIC_OFFSET)
                .store(DIRECTORY_MAGIC, Ordering::Release);
        }
        region
            .persist(MAGIC_OFFSET, 8)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            region,
            n_slots,
        })
    }

    /// Maps an existing directory file and validates its header. Anything
    /// that fails validation unmaps and reports `Corrupt`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => Error::new(ErrorKind::NotFound)
                    .with_message("no such directory file")
                    .with_path(&path),
                _ => Error::new(ErrorKind::Io).with_path(&path).with_source(err),
            })?;
        lock(&file, &path)?;

        let map = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?
        };
        let region = Arc::new(Region::new(map));

        let mapped_length = region.len();
        if mapped_length < DIRECTORY_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("file smaller than directory header")
                .with_path(&path));
        }
        if region.read_u64(MAGIC_OFFSET) != DIRECTORY_MAGIC {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("bad magic")
                .with_path(&path));
        }
        let n_slots = region.read_u64(N_SLOTS_OFFSET);
        if n_slots == 0 || n_slots > (mapped_length - DIRECTORY_HEADER_LEN) / 8 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("slot count out of bounds")
                .with_path(&path));
        }

        Ok(Self {
            path,
            file,
            region,
            n_slots,
        })
    }

    /// Opens `path` if it exists (requiring at least `n_slots` slots and a
    /// clean sweep), or creates a fresh directory. The startup entry point.
    pub fn init(path: impl AsRef<Path>, size: u64, n_slots: u64) -> Result<Self, Error> {
        let path = path.as_ref();
        if path.exists() {
            let dir = Self::open(path)?;
            if dir.n_slots < n_slots {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!(
                        "directory has {} slots, {} requested",
                        dir.n_slots, n_slots
                    ))
                    .with_path(path)
                    .with_hint("Recreate the directory file with more slots."));
            }
            dir.sweep()?;
            return Ok(dir);
        }
        Self::create(path, size, n_slots)
    }

    /// Replays every slot's unflushed tail into its target file and frees
    /// the slots. See `core::sweep`.
    pub fn sweep(&self) -> Result<(), Error> {
        sweep::sweep(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn n_slots(&self) -> u64 {
        self.n_slots
    }

    pub fn mapped_length(&self) -> u64 {
        self.region.len()
    }

    pub(crate) fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// Validated byte range of slot `index`; the last slot extends to the
    /// end of the mapping.
    pub fn slot_bounds(&self, index: u64) -> Result<SlotBounds, Error> {
        if index >= self.n_slots {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("slot index out of range")
                .with_slot(index));
        }
        let start = self.region.read_u64(offset_table_entry(index));
        let end = if index == self.n_slots - 1 {
            self.region.len()
        } else {
            self.region.read_u64(offset_table_entry(index + 1))
        };
        SlotBounds::validate(start, end, self.n_slots, self.region.len())
            .map_err(|err| err.with_slot(index).with_path(&self.path))
    }

    pub(crate) fn open_slot(&self, index: u64) -> Result<Slot, Error> {
        Slot::open(self.region.clone(), self.slot_bounds(index)?, index)
    }

    /// Geometry and per-slot state, for the `info` administrative command.
    pub fn info(&self) -> Result<DirectoryInfo, Error> {
        let mut slots = Vec::with_capacity(self.n_slots as usize);
        for index in 0..self.n_slots {
            let slot = self.open_slot(index)?;
            slots.push(SlotInfo {
                index,
                attached: !slot.is_free(),
                file_name: if slot.is_free() {
                    None
                } else {
                    Some(slot.stored_name()?.display().to_string())
                },
                buffer_size: slot.buffer_size(),
                flushed_eof: slot.flushed_eof(),
                cached_eof: slot.cached_eof(),
            });
        }
        Ok(DirectoryInfo {
            path: self.path.display().to_string(),
            mapped_length: self.region.len(),
            n_slots: self.n_slots,
            slots,
        })
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Serialize)]
pub struct DirectoryInfo {
    pub path: String,
    pub mapped_length: u64,
    pub n_slots: u64,
    pub slots: Vec<SlotInfo>,
}

#[derive(Debug, Serialize)]
pub struct SlotInfo {
    pub index: u64,
    pub attached: bool,
    pub file_name: Option<String>,
    pub buffer_size: u64,
    pub flushed_eof: u64,
    pub cached_eof: u64,
}

fn lock(file: &File, path: &Path) -> Result<(), Error> {
    file.try_lock_exclusive().map_err(|err| {
        Error::new(lock_error_kind(&err))
            .with_message("directory file is locked by another process")
            .with_path(path)
            .with_source(err)
    })
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Busy;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Busy,
        _ => ErrorKind::Io,
    }
}
