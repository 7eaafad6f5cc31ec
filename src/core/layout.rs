// On-media layout: directory header, slot offset table, slot header fields.
// All integers are native-endian u64 at 8-byte-aligned offsets, matching the
// atomic counter views taken over the mapping. Directory files are not
// portable across hosts of different endianness.
use crate::core::error::{Error, ErrorKind};

/// "PMSTAGE\0", written and persisted last during creation so a
/// half-initialized directory file is never mistaken for a valid one.
pub const DIRECTORY_MAGIC: u64 = u64::from_le_bytes(*b"PMSTAGE\0");

pub const MAGIC_OFFSET: u64 = 0;
pub const N_SLOTS_OFFSET: u64 = 8;
pub const DIRECTORY_HEADER_LEN: u64 = 16;

/// Slot header: file_name_len, flushed_eof, cached_eof.
pub const SLOT_HEADER_LEN: u64 = 24;

pub const SLOT_NAME_LEN_FIELD: u64 = 0;
pub const SLOT_FLUSHED_EOF_FIELD: u64 = 8;
pub const SLOT_CACHED_EOF_FIELD: u64 = 16;

/// Full directory header size including the per-slot offset table.
pub fn directory_header_size(n_slots: u64) -> u64 {
    DIRECTORY_HEADER_LEN + 8 * n_slots
}

/// Absolute offset of the i-th entry in the slot offset table.
pub fn offset_table_entry(index: u64) -> u64 {
    DIRECTORY_HEADER_LEN + 8 * index
}

/// Per-slot byte count for a directory of `total_size` holding `n_slots`
/// equal partitions, rounded down to 8-byte alignment.
pub fn slot_size(total_size: u64, n_slots: u64) -> Result<u64, Error> {
    if n_slots == 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("slot count must be nonzero"));
    }
    let header_size = directory_header_size(n_slots);
    if total_size < header_size {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("directory size smaller than its header"));
    }
    let size = ((total_size - header_size) / n_slots) & !7u64;
    if size < SLOT_HEADER_LEN {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("per-slot size smaller than the slot header"));
    }
    Ok(size)
}

/// Validated byte range of one slot inside the mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlotBounds {
    pub start: u64,
    pub end: u64,
}

impl SlotBounds {
    /// Checks a slot range read back from the offset table against the
    /// mapping it must live in. Rejects anything a torn or hostile
    /// directory file could carry.
    pub fn validate(
        start: u64,
        end: u64,
        n_slots: u64,
        mapped_length: u64,
    ) -> Result<Self, Error> {
        let header_size = directory_header_size(n_slots);
        if start < header_size
            || start > end
            || start % 8 != 0
            || end > mapped_length
            || end - start < SLOT_HEADER_LEN
        {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("slot bounds out of range")
                .with_offset(start));
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn name_len_offset(&self) -> u64 {
        self.start + SLOT_NAME_LEN_FIELD
    }

    pub fn flushed_eof_offset(&self) -> u64 {
        self.start + SLOT_FLUSHED_EOF_FIELD
    }

    pub fn cached_eof_offset(&self) -> u64 {
        self.start + SLOT_CACHED_EOF_FIELD
    }

    /// Offset of the stored file name (immediately after the slot header).
    pub fn name_offset(&self) -> u64 {
        self.start + SLOT_HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::{
        directory_header_size, slot_size, SlotBounds, DIRECTORY_HEADER_LEN, DIRECTORY_MAGIC,
        SLOT_HEADER_LEN,
    };
    use crate::core::error::ErrorKind;

    #[test]
    fn magic_is_eight_ascii_bytes() {
        assert_eq!(&DIRECTORY_MAGIC.to_le_bytes(), b"PMSTAGE\0");
    }

    #[test]
    fn header_size_counts_offset_table() {
        assert_eq!(directory_header_size(0), DIRECTORY_HEADER_LEN);
        assert_eq!(directory_header_size(4), DIRECTORY_HEADER_LEN + 32);
    }

    #[test]
    fn slot_size_is_aligned_and_bounded() {
        let size = slot_size(1024 * 1024, 4).expect("slot size");
        assert_eq!(size % 8, 0);
        assert!(size >= SLOT_HEADER_LEN);

        let err = slot_size(1024, 0).expect_err("zero slots");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let err = slot_size(8, 1).expect_err("size below header");
        assert_eq!(err.kind(), ErrorKind::Usage);

        // Large slot count leaves less than a slot header per slot.
        let err = slot_size(directory_header_size(64) + 64, 64).expect_err("tiny slots");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn bounds_validation_rejects_garbage() {
        let n_slots = 2;
        let mapped = 4096;

        SlotBounds::validate(directory_header_size(n_slots), 1024, n_slots, mapped)
            .expect("valid bounds");

        // Start inside the header.
        assert!(SlotBounds::validate(8, 1024, n_slots, mapped).is_err());
        // Misaligned start.
        assert!(SlotBounds::validate(36, 1024, n_slots, mapped).is_err());
        // Inverted range.
        assert!(SlotBounds::validate(1024, 512, n_slots, mapped).is_err());
        // End past the mapping.
        assert!(SlotBounds::validate(1024, mapped + 8, n_slots, mapped).is_err());
        // Too small for a slot header.
        assert!(SlotBounds::validate(1024, 1024 + 8, n_slots, mapped).is_err());
    }
}
