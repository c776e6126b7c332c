pub mod cache;
pub mod cluster;
pub mod collector;
pub mod config;
pub mod error;
pub mod http;
pub mod kafka;
pub mod metrics;

#[cfg(test)]
mod test_strategies;
