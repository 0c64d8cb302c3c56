pub mod canonical;
pub mod channel;
pub mod channel_cache;
pub mod cost;
pub mod meta;
pub mod token;
pub mod user;
