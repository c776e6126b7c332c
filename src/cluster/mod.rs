pub mod manager;

pub use manager::{Backends, ClusterManager, CycleSummary};
