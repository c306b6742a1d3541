//! Building blocks for [`clap`]-driven configs of the cachesync binary.
pub mod object_store;
pub mod sync;
