pub mod auth;
pub mod metrics;
pub mod quota;
pub mod rate_limit;
