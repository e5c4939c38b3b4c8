pub mod config;
pub mod http;
mod rate_limit;
