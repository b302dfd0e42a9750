//! Test cases: the statement model, the callable surface they draw from and
//! random construction.

mod cluster;
mod factory;
mod model;

pub use cluster::TestCluster;
pub use factory::TestFactory;
pub use model::{var_name, Primitive, StatementKind, TestCase};
