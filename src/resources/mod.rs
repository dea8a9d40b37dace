pub mod cluster_ops;
pub mod exec;
pub mod failover;
pub mod instance;
pub mod labels;
pub mod replica;
pub mod storage;

pub use cluster_ops::{ClusterOps, KubeClusterOps};
pub use exec::ExecOutput;
pub use storage::StorageResult;
