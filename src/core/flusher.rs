// Background drain thread, one per attached slot.
//
// Running: drain, sleep, repeat. A stop request is honored only after one
// final drain pass, so cooperative shutdown never drops committed bytes.
use std::fs::File;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::core::error::{Error, ErrorKind};
use crate::core::slot::Slot;

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(1);

pub fn spawn(slot: Arc<Slot>, file: Arc<File>) -> Result<JoinHandle<()>, Error> {
    thread::Builder::new()
        .name(format!("pmstage-flush-{}", slot.index()))
        .spawn(move || run(&slot, &file))
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to start flusher thread")
                .with_source(err)
        })
}

fn run(slot: &Slot, file: &File) {
    while !slot.stop.load(Ordering::Relaxed) {
        drain(slot, file);
        thread::sleep(FLUSH_INTERVAL);
    }
    // Final draining pass after the stop signal.
    drain(slot, file);
}

// A failed flush cannot be rolled back: the counters already promised
// durability and writers may be reusing vacated ring space. Fail loud.
fn drain(slot: &Slot, file: &File) {
    if let Err(err) = slot.flush_pass(file) {
        tracing::error!(slot = slot.index(), %err, "flush failed, aborting");
        std::process::abort();
    }
}
