// Recovery replay: reconcile every slot after an unclean shutdown.
use std::fs::OpenOptions;
use std::io;

use crate::core::directory::Directory;
use crate::core::error::{Error, ErrorKind};

/// Replays each attached slot's unflushed tail into its target file, then
/// frees the slot. Free slots are skipped; slots with nothing pending are
/// reclaimed immediately. Any failure aborts the sweep with the directory
/// unmodified beyond slots already reconciled, so running it again is safe
/// (and a second run over a clean directory is a no-op).
pub fn sweep(dir: &Directory) -> Result<(), Error> {
    for index in 0..dir.n_slots() {
        let slot = dir.open_slot(index)?;
        if slot.is_free() {
            continue;
        }
        if slot.flushed_eof() == slot.cached_eof() {
            slot.reclaim()?;
            continue;
        }

        let name = slot.stored_name()?;
        let pending = slot.cached_eof() - slot.flushed_eof();
        tracing::debug!(slot = index, file = %name.display(), pending, "replaying slot");

        let file = OpenOptions::new().write(true).open(&name).map_err(|err| {
            let kind = if err.kind() == io::ErrorKind::NotFound {
                ErrorKind::NotFound
            } else {
                ErrorKind::Io
            };
            Error::new(kind)
                .with_message("cannot open target file for replay")
                .with_path(&name)
                .with_slot(index)
                .with_source(err)
        })?;
        let file_len = file
            .metadata()
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&name).with_source(err))?
            .len();
        if file_len < slot.flushed_eof() {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("target file shorter than its flushed watermark")
                .with_path(&name)
                .with_slot(index)
                .with_offset(slot.flushed_eof()));
        }

        slot.flush_pass(&file)?;
        slot.reclaim()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::core::cache::AppendCache;
    use crate::core::directory::Directory;
    use crate::core::error::ErrorKind;

    #[test]
    fn sweep_of_fresh_directory_is_a_no_op() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("cache.pmstage");
        let dir = Directory::create(&path, 1 << 20, 4).expect("create");
        dir.sweep().expect("sweep");
        dir.sweep().expect("sweep twice");
    }

    // Builds the post-crash media state: slot claimed, bytes committed to
    // the ring, nothing flushed, no flusher thread ever started.
    fn crash_with_pending(dir_path: &std::path::Path, target: &std::path::Path, data: &[u8]) {
        let dir = Directory::create(dir_path, 1 << 20, 4).expect("create");
        let mut slot = dir.open_slot(0).expect("slot");
        slot.claim(target, 0).expect("claim");
        assert_eq!(slot.write(data), data.len() as u64);
        assert_eq!(slot.cached_eof(), data.len() as u64);
        assert_eq!(slot.flushed_eof(), 0);
    }

    #[test]
    fn sweep_replays_crashed_slot() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir_path = tmp.path().join("cache.pmstage");
        let target_path = tmp.path().join("target.bin");
        std::fs::File::create(&target_path).expect("target");

        crash_with_pending(&dir_path, &target_path, b"ten bytes!");

        let dir = Directory::open(&dir_path).expect("reopen");
        assert!(dir.info().expect("info").slots[0].attached);

        dir.sweep().expect("sweep");
        assert_eq!(std::fs::read(&target_path).expect("read"), b"ten bytes!");
        assert!(!dir.info().expect("info").slots[0].attached);

        // Idempotence: a second sweep finds nothing to do.
        dir.sweep().expect("sweep again");
    }

    #[test]
    fn sweep_reclaims_clean_detach_leftover() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir_path = tmp.path().join("cache.pmstage");
        let target_path = tmp.path().join("target.bin");
        std::fs::File::create(&target_path).expect("target");

        {
            let dir = Directory::create(&dir_path, 1 << 20, 4).expect("create");
            let target = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&target_path)
                .expect("open target");
            let cache = AppendCache::attach(&dir, 0, target, &target_path).expect("attach");
            cache.write(b"drained").expect("write");
            cache.flush(0).expect("flush");
            // Crash after a full drain: Drop stops the flusher but leaves
            // the slot attached.
        }

        let dir = Directory::open(&dir_path).expect("reopen");
        assert!(dir.info().expect("info").slots[0].attached);
        dir.sweep().expect("sweep");
        assert!(!dir.info().expect("info").slots[0].attached);
        assert_eq!(std::fs::read(&target_path).expect("read"), b"drained");
    }

    #[test]
    fn sweep_fails_when_target_file_is_missing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir_path = tmp.path().join("cache.pmstage");
        let target_path = tmp.path().join("target.bin");
        std::fs::File::create(&target_path).expect("target");

        crash_with_pending(&dir_path, &target_path, b"pending");
        std::fs::remove_file(&target_path).expect("remove target");

        let dir = Directory::open(&dir_path).expect("reopen");
        let err = dir.sweep().expect_err("missing target");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // The slot was not released.
        assert!(dir.info().expect("info").slots[0].attached);
    }

    #[test]
    fn sweep_fails_when_target_file_shrank() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir_path = tmp.path().join("cache.pmstage");
        let target_path = tmp.path().join("target.bin");
        std::fs::write(&target_path, vec![0u8; 128]).expect("target");

        {
            let dir = Directory::create(&dir_path, 1 << 20, 4).expect("create");
            let mut slot = dir.open_slot(0).expect("slot");
            // Watermarks seeded from a 128-byte file.
            slot.claim(&target_path, 128).expect("claim");
            slot.write(b"tail");
        }

        // Someone truncated the target behind the cache's back.
        std::fs::File::create(&target_path).expect("truncate");

        let dir = Directory::open(&dir_path).expect("reopen");
        let err = dir.sweep().expect_err("shrunk target");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
