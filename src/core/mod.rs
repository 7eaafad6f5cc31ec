// Core modules implementing the staging cache: media layout, slot commit
// protocol, background flushing, recovery, and error modeling.
pub mod cache;
pub mod directory;
pub mod error;
pub mod flusher;
pub mod layout;
pub mod region;
pub mod slot;
pub mod spin;
pub mod sweep;
