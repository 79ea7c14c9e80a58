//! MySQL backend adapter for Tessera, built on the `mysql` crate.

mod driver;

pub use driver::{register, MysqlAdapter};
