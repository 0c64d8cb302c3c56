pub mod batch_update;
pub mod channel_sync;
