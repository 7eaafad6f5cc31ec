// Shared view of the memory-mapped directory file.
//
// Writers and flushers mutate disjoint byte ranges of the same mapping from
// several threads, so the mapping sits behind an `UnsafeCell` and all access
// goes through offset-based accessors. The only shared-and-contended words
// are the slot counters, which are read and written as `AtomicU64` views
// directly over the mapped bytes.
use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::AtomicU64;

use memmap2::MmapMut;

/// Memory-mapped region with interior mutability.
///
/// # Safety
/// Callers must uphold the commit-protocol discipline: plain byte writes only
/// to ranges they exclusively reserved, plain reads only from ranges no
/// writer currently owns, counters only through [`Region::u64_at`].
#[derive(Debug)]
pub struct Region {
    map: UnsafeCell<MmapMut>,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn new(map: MmapMut) -> Self {
        let len = map.len();
        Self {
            map: UnsafeCell::new(map),
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len as u64
    }

    /// Copies `data` into the mapping at `offset`.
    ///
    /// # Safety
    /// The caller must own `[offset, offset + data.len())` exclusively and
    /// the range must lie inside the mapping.
    pub unsafe fn write_bytes(&self, offset: u64, data: &[u8]) {
        debug_assert!(offset as usize + data.len() <= self.len);
        unsafe {
            let base = (*self.map.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset as usize), data.len());
        }
    }

    /// Borrows `len` mapped bytes starting at `offset`.
    ///
    /// # Safety
    /// No writer may own any part of the range for the lifetime of the
    /// returned slice.
    pub unsafe fn bytes(&self, offset: u64, len: u64) -> &[u8] {
        debug_assert!(offset + len <= self.len as u64);
        unsafe {
            let base = (*self.map.get()).as_ptr();
            std::slice::from_raw_parts(base.add(offset as usize), len as usize)
        }
    }

    /// Views the eight mapped bytes at `offset` as an atomic counter.
    ///
    /// # Safety
    /// `offset` must be 8-byte aligned and inside the mapping. All live
    /// access to these bytes must go through this view.
    pub unsafe fn u64_at(&self, offset: u64) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset as usize + 8 <= self.len);
        unsafe {
            let base = (*self.map.get()).as_ptr();
            &*(base.add(offset as usize) as *const AtomicU64)
        }
    }

    /// Reads a u64 field at rest (open/create/inspect paths, no concurrent
    /// writer for the field).
    pub fn read_u64(&self, offset: u64) -> u64 {
        // Relaxed atomic load keeps this defined even if a stale process
        // still has the file mapped.
        unsafe { self.u64_at(offset).load(std::sync::atomic::Ordering::Relaxed) }
    }

    /// Makes `[offset, offset + len)` durable on the backing media (ranged
    /// msync). This is the portable equivalent of a pmem persist.
    pub fn persist(&self, offset: u64, len: u64) -> io::Result<()> {
        unsafe { (*self.map.get()).flush_range(offset as usize, len as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::Region;
    use memmap2::MmapMut;
    use std::sync::atomic::Ordering;

    fn anon_region(len: usize) -> Region {
        Region::new(MmapMut::map_anon(len).expect("anon map"))
    }

    #[test]
    fn bytes_round_trip() {
        let region = anon_region(64);
        unsafe {
            region.write_bytes(8, b"pmstage");
            assert_eq!(region.bytes(8, 7), b"pmstage");
        }
    }

    #[test]
    fn atomic_view_aliases_plain_bytes() {
        let region = anon_region(64);
        unsafe {
            region.u64_at(16).store(0x1122334455667788, Ordering::Release);
        }
        assert_eq!(region.read_u64(16), 0x1122334455667788);
        assert_eq!(
            unsafe { region.bytes(16, 8) },
            &0x1122334455667788u64.to_ne_bytes()
        );
    }

    #[test]
    fn persist_accepts_any_alignment() {
        let region = anon_region(8192);
        unsafe { region.write_bytes(4100, &[7u8; 16]) };
        region.persist(4100, 16).expect("flush range");
    }
}
