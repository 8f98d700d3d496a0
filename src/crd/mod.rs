//! Custom Resource Definitions (CRDs) for dbcluster-operator.
//!
//! - `DatabaseCluster`: one multi-component distributed database cluster

mod database_cluster;

pub use database_cluster::*;
