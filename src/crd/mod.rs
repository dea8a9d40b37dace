mod common;
mod pgcluster;
mod pgreplica;
mod pgtask;

pub use common::*;
pub use pgcluster::*;
pub use pgreplica::*;
pub use pgtask::*;
