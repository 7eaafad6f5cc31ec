// One directory slot: header counters, stored file name, and the ring
// buffer. Hosts the multi-writer commit protocol and the drain pass shared
// by the flusher thread and recovery sweep.
//
// Counter discipline, everywhere: persist the on-media word first, then
// update the in-memory mirror. Readers of the mirrors can therefore never
// observe progress that would not survive a crash.
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::{SlotBounds, SLOT_HEADER_LEN};
use crate::core::region::Region;
use crate::core::spin::Backoff;

#[derive(Debug)]
pub struct Slot {
    region: Arc<Region>,
    bounds: SlotBounds,
    index: u64,
    /// Absolute offset of the ring buffer's first byte.
    buffer_offset: u64,
    buffer_size: u64,
    name_len: u64,
    /// Next free logical offset handed to a writer. Volatile only.
    reserved_eof: AtomicU64,
    /// Mirror of the persistent cached_eof, for lock-free readers.
    cached_eof: AtomicU64,
    /// Mirror of the persistent flushed_eof, for lock-free readers.
    flushed_eof: AtomicU64,
    pub(crate) stop: AtomicBool,
}

impl Slot {
    /// Builds a validated view of slot `index` covering `bounds`. Works for
    /// free and attached slots; for attached slots the ring starts after the
    /// stored name.
    pub fn open(region: Arc<Region>, bounds: SlotBounds, index: u64) -> Result<Self, Error> {
        let capacity = bounds.len() - SLOT_HEADER_LEN;
        let name_len = region.read_u64(bounds.name_len_offset());
        if name_len >= capacity {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("stored file name exceeds slot capacity")
                .with_slot(index));
        }

        let flushed = region.read_u64(bounds.flushed_eof_offset());
        let cached = region.read_u64(bounds.cached_eof_offset());
        let buffer_size = capacity - name_len;
        if cached < flushed || cached - flushed > buffer_size {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("slot counters violate ring invariant")
                .with_slot(index));
        }

        Ok(Self {
            region,
            bounds,
            index,
            buffer_offset: bounds.name_offset() + name_len,
            buffer_size,
            name_len,
            reserved_eof: AtomicU64::new(cached),
            cached_eof: AtomicU64::new(cached),
            flushed_eof: AtomicU64::new(flushed),
            stop: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn is_free(&self) -> bool {
        self.name_len == 0
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn flushed_eof(&self) -> u64 {
        self.flushed_eof.load(Ordering::Acquire)
    }

    pub fn cached_eof(&self) -> u64 {
        self.cached_eof.load(Ordering::Acquire)
    }

    pub fn reserved_eof(&self) -> u64 {
        self.reserved_eof.load(Ordering::Relaxed)
    }

    /// The file name recorded at attach time. Requires the stored bytes to
    /// end in the NUL written by `claim`; anything else means the header
    /// cannot be trusted.
    pub fn stored_name(&self) -> Result<PathBuf, Error> {
        if self.name_len == 0 {
            return Err(Error::new(ErrorKind::Internal)
                .with_message("free slot has no stored name")
                .with_slot(self.index));
        }
        let bytes = unsafe { self.region.bytes(self.bounds.name_offset(), self.name_len) };
        match bytes.split_last() {
            Some((0, name)) => Ok(PathBuf::from(std::ffi::OsStr::from_bytes(name))),
            _ => Err(Error::new(ErrorKind::Corrupt)
                .with_message("stored file name is not NUL-terminated")
                .with_slot(self.index)),
        }
    }

    /// Binds this free slot to `file_name`, seeding all three watermarks
    /// from the target file's current size. Every field is written and made
    /// durable while the slot still reads as free; the nonzero name length
    /// lands last, as the ownership claim.
    pub fn claim(&mut self, file_name: &Path, file_size: u64) -> Result<(), Error> {
        debug_assert!(self.is_free());
        let name = file_name.as_os_str().as_bytes();
        if name.contains(&0) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("file name contains a NUL byte")
                .with_path(file_name));
        }
        let name_len = name.len() as u64 + 1;
        if name_len >= self.buffer_size {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("file name does not fit in the slot")
                .with_path(file_name)
                .with_slot(self.index));
        }

        unsafe {
            self.region
                .u64_at(self.bounds.flushed_eof_offset())
                .store(file_size, Ordering::Relaxed);
            self.region
                .u64_at(self.bounds.cached_eof_offset())
                .store(file_size, Ordering::Relaxed);
            self.region.write_bytes(self.bounds.name_offset(), name);
            self.region
                .write_bytes(self.bounds.name_offset() + name.len() as u64, &[0]);
        }
        self.region
            .persist(self.bounds.start, SLOT_HEADER_LEN + name_len)
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to persist slot header")
                    .with_slot(self.index)
                    .with_source(err)
            })?;

        unsafe {
            self.region
                .u64_at(self.bounds.name_len_offset())
                .store(name_len, Ordering::Release);
        }
        self.region.persist(self.bounds.name_len_offset(), 8).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to persist slot ownership")
                .with_slot(self.index)
                .with_source(err)
        })?;

        self.name_len = name_len;
        self.buffer_offset = self.bounds.name_offset() + name_len;
        self.buffer_size -= name_len;
        self.reserved_eof.store(file_size, Ordering::Relaxed);
        self.cached_eof.store(file_size, Ordering::Relaxed);
        self.flushed_eof.store(file_size, Ordering::Relaxed);
        Ok(())
    }

    /// Marks the slot free again. Only legal once every cached byte reached
    /// the target file.
    pub fn reclaim(&self) -> Result<(), Error> {
        debug_assert_eq!(self.cached_eof(), self.flushed_eof());
        unsafe {
            self.region
                .u64_at(self.bounds.name_len_offset())
                .store(0, Ordering::Release);
        }
        self.region.persist(self.bounds.name_len_offset(), 8).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to persist slot release")
                .with_slot(self.index)
                .with_source(err)
        })
    }

    /// Multi-writer append; returns the number of bytes accepted (always
    /// `data.len()`). The reserved range is owned exclusively by this call;
    /// copies run fully in parallel while commits become visible in strict
    /// reservation order.
    pub fn write(&self, data: &[u8]) -> u64 {
        if data.is_empty() {
            return 0;
        }
        let len = data.len() as u64;
        let start = self.reserved_eof.fetch_add(len, Ordering::Relaxed);
        let mut write_pos = start;
        let mut remaining = data;

        while !remaining.is_empty() {
            let chunk_offset = write_pos % self.buffer_size;

            // Backpressure: wait for the flusher to vacate ring space. The
            // strict `>` keeps the avail == 0 case spinning.
            let mut backoff = Backoff::new();
            let avail = loop {
                let flushed = self.flushed_eof.load(Ordering::Acquire);
                if flushed + self.buffer_size > write_pos {
                    break flushed + self.buffer_size - write_pos;
                }
                backoff.snooze();
            };

            let take = avail
                .min(remaining.len() as u64)
                .min(self.buffer_size - chunk_offset);
            let (chunk, rest) = remaining.split_at(take as usize);

            // Payload bytes are durable before any counter can expose them.
            unsafe {
                self.region
                    .write_bytes(self.buffer_offset + chunk_offset, chunk);
            }
            self.must_persist(self.buffer_offset + chunk_offset, take);

            remaining = rest;
            write_pos += take;

            // Ordering gate: every earlier reservation must have committed.
            let mut backoff = Backoff::new();
            while self.cached_eof.load(Ordering::Acquire) < start {
                backoff.snooze();
            }
            self.publish_cached(write_pos);
        }
        len
    }

    /// One drain pass: append committed-but-unflushed bytes to `file` and
    /// advance flushed_eof. Never called concurrently with itself for the
    /// same slot (single flusher thread, or sweep with no live process).
    pub fn flush_pass(&self, file: &File) -> Result<(), Error> {
        let mut flushed = self.flushed_eof.load(Ordering::Acquire);
        loop {
            let cached = self.cached_eof.load(Ordering::Acquire);
            if flushed >= cached {
                return Ok(());
            }
            // Longest contiguous run that does not cross the physical wrap.
            let write_size = if cached / self.buffer_size == flushed / self.buffer_size {
                cached - flushed
            } else {
                self.buffer_size - flushed % self.buffer_size
            };
            let run = unsafe {
                self.region
                    .bytes(self.buffer_offset + flushed % self.buffer_size, write_size)
            };
            let written = file.write_at(run, flushed).map_err(|err| {
                Error::new(ErrorKind::Fatal)
                    .with_message("flush write failed")
                    .with_slot(self.index)
                    .with_offset(flushed)
                    .with_source(err)
            })?;
            if written == 0 {
                return Err(Error::new(ErrorKind::Fatal)
                    .with_message("flush wrote zero bytes")
                    .with_slot(self.index)
                    .with_offset(flushed));
            }
            file.sync_data().map_err(|err| {
                Error::new(ErrorKind::Fatal)
                    .with_message("flush fsync failed")
                    .with_slot(self.index)
                    .with_offset(flushed)
                    .with_source(err)
            })?;
            // Partial writes are fine; the loop finishes the rest.
            flushed += written as u64;
            self.publish_flushed(flushed);
        }
    }

    /// Spins until the target file is durable up to `offset`; `offset == 0`
    /// means everything committed as of the call.
    pub fn wait_flushed(&self, offset: u64) {
        let target = if offset == 0 {
            self.cached_eof.load(Ordering::Acquire)
        } else {
            offset
        };
        let mut backoff = Backoff::new();
        while self.flushed_eof.load(Ordering::Acquire) < target {
            backoff.snooze();
        }
    }

    fn publish_cached(&self, value: u64) {
        let offset = self.bounds.cached_eof_offset();
        unsafe { self.region.u64_at(offset) }.store(value, Ordering::Release);
        self.must_persist(offset, 8);
        self.cached_eof.store(value, Ordering::Release);
    }

    fn publish_flushed(&self, value: u64) {
        let offset = self.bounds.flushed_eof_offset();
        unsafe { self.region.u64_at(offset) }.store(value, Ordering::Release);
        self.must_persist(offset, 8);
        self.flushed_eof.store(value, Ordering::Release);
    }

    /// Persist on the commit path. Once a writer owns a range there is no
    /// way to hand it back, so a media failure here ends the process rather
    /// than retract a durability promise.
    fn must_persist(&self, offset: u64, len: u64) {
        if let Err(err) = self.region.persist(offset, len) {
            tracing::error!(slot = self.index, offset, len, %err, "persist failed");
            std::process::abort();
        }
    }
}
