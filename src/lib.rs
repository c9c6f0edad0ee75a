#![deny(missing_docs)]
//! 一个在多种存储引擎之上提供统一接口的键值对存储库。
//!
//! 引擎 (SQLite、LSM、sled B-tree) 通过cargo feature在编译期选择，
//! 均实现 [`KvsEngine`]：put/get/delete 以及按键序的范围 dump。

pub use driver::{os_bytes, plan_sources, Delimiter, Driver, Operation, Source};
pub use engines::{Dump, Engine, KeyRange, KvPair, KvsEngine, Mode};
#[cfg(feature = "lsm")]
pub use engines::LsmEngine;
#[cfg(feature = "btree")]
pub use engines::SledEngine;
#[cfg(feature = "sqlite")]
pub use engines::SqliteEngine;
pub use error::{KvsError, Result};
pub use store::DataStore;

#[macro_use]
extern crate slog;

mod driver;
mod engines;
mod error;
mod store;
