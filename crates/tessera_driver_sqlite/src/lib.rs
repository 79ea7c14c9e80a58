//! SQLite backend adapter for Tessera, built on `rusqlite` (bundled).

mod driver;

pub use driver::{register, SqliteAdapter};
