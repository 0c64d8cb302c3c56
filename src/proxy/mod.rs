pub mod adapter;
pub mod event_stream;
pub mod failover;
pub mod handler;
pub mod relay;
pub mod selector;
pub mod sigv4;
pub mod sse;
pub mod stream_bridge;
pub mod upstream;
