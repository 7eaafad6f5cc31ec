// The writer-facing append cache handle: attach/detach, write, flush, sync.
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::core::directory::Directory;
use crate::core::error::{Error, ErrorKind};
use crate::core::flusher;
use crate::core::slot::Slot;

/// Append handle for one target file.
///
/// In caching mode, writes land in a directory slot's persistent ring and a
/// background flusher drains them into the target file. In pass-through
/// mode (no directory configured, e.g. no PMEM on the host) writes go
/// straight to the file.
///
/// `write` and `flush` may be called from many threads at once; `detach`
/// must not run concurrently with any writer.
#[derive(Debug)]
pub struct AppendCache {
    backend: Backend,
}

#[derive(Debug)]
enum Backend {
    Cached {
        slot: Arc<Slot>,
        flusher: Option<JoinHandle<()>>,
        released: bool,
    },
    Direct {
        file: File,
    },
}

impl AppendCache {
    /// Binds directory slot `index` to `file`, seeding the cache's
    /// watermarks from the file's current size, and starts the flusher.
    /// `file` must be open for writing. Fails if the slot is already
    /// attached or the name does not fit.
    pub fn attach(
        dir: &Directory,
        index: u64,
        file: File,
        file_name: &Path,
    ) -> Result<Self, Error> {
        let mut slot = dir.open_slot(index)?;
        if !slot.is_free() {
            return Err(Error::new(ErrorKind::Busy)
                .with_message("slot is already attached")
                .with_slot(index)
                .with_hint("Detach the slot or run a sweep first."));
        }
        let file_size = file
            .metadata()
            .map_err(|err| Error::new(ErrorKind::Io).with_path(file_name).with_source(err))?
            .len();
        slot.claim(file_name, file_size)?;
        tracing::debug!(slot = index, file = %file_name.display(), file_size, "attached");

        let slot = Arc::new(slot);
        let flusher = flusher::spawn(slot.clone(), Arc::new(file))?;
        Ok(Self {
            backend: Backend::Cached {
                slot,
                flusher: Some(flusher),
                released: false,
            },
        })
    }

    /// Pass-through binding: no staging, writes go straight to `file`.
    /// A legitimate configuration when no persistent memory is available.
    pub fn passthrough(file: File) -> Self {
        Self {
            backend: Backend::Direct { file },
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self.backend, Backend::Direct { .. })
    }

    /// Appends `data`. In caching mode this returns once the payload is
    /// durable in the staging ring and visible in reservation order; the
    /// real file catches up asynchronously.
    pub fn write(&self, data: &[u8]) -> Result<u64, Error> {
        match &self.backend {
            Backend::Cached { slot, .. } => Ok(slot.write(data)),
            Backend::Direct { file } => {
                let written = (&*file)
                    .write(data)
                    .map_err(|err| Error::new(ErrorKind::Io).with_source(err))?;
                Ok(written as u64)
            }
        }
    }

    /// Waits until the target file is durable up to `offset`; `offset == 0`
    /// means all data committed as of the call. Pass-through writes are
    /// already in the file, so this is a no-op there.
    pub fn flush(&self, offset: u64) -> Result<(), Error> {
        if let Backend::Cached { slot, .. } = &self.backend {
            slot.wait_flushed(offset);
        }
        Ok(())
    }

    /// Durability barrier. Caching mode is continuously durable, so only
    /// pass-through has work to do.
    pub fn sync(&self) -> Result<(), Error> {
        match &self.backend {
            Backend::Cached { .. } => Ok(()),
            Backend::Direct { file } => file
                .sync_data()
                .map_err(|err| Error::new(ErrorKind::Io).with_source(err)),
        }
    }

    /// Stops the flusher, waits for its final drain, and releases the slot.
    /// If any committed byte failed to reach the target file the slot stays
    /// attached and the call reports `Busy`; retrying later is safe.
    pub fn detach(&mut self) -> Result<(), Error> {
        let Backend::Cached {
            slot,
            flusher,
            released,
            ..
        } = &mut self.backend
        else {
            return Ok(());
        };
        if *released {
            return Ok(());
        }

        slot.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = flusher.take() {
            handle.join().map_err(|_| {
                Error::new(ErrorKind::Internal).with_message("flusher thread panicked")
            })?;
        }

        if slot.flushed_eof() != slot.cached_eof() {
            return Err(Error::new(ErrorKind::Busy)
                .with_message("cached data not fully flushed")
                .with_slot(slot.index())
                .with_offset(slot.flushed_eof()));
        }
        slot.reclaim()?;
        *released = true;
        tracing::debug!(slot = slot.index(), "detached");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn watermarks(&self) -> Option<(u64, u64, u64)> {
        match &self.backend {
            Backend::Cached { slot, .. } => {
                Some((slot.flushed_eof(), slot.cached_eof(), slot.reserved_eof()))
            }
            Backend::Direct { .. } => None,
        }
    }
}

impl Drop for AppendCache {
    // Dropping without detach mirrors a crash: stop the flusher after its
    // final drain, but leave the slot attached for the next sweep.
    fn drop(&mut self) {
        if let Backend::Cached { slot, flusher, .. } = &mut self.backend {
            slot.stop.store(true, Ordering::Relaxed);
            if let Some(handle) = flusher.take() {
                let _ = handle.join();
            }
        }
    }
}
