//! Purpose: Define the public Rust API boundary for gedis.
//! Exports: Registry, host modules, values, and error types needed by the binary.
//! Role: Additive-only surface; hides interpreter and pool internals.
//! Invariants: Callers reach packages only through `PackageManager`.

mod manager;
mod modules;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::module::Module;
pub use crate::core::package::{DEFAULT_POOL_SIZE, Package, PackageOptions, check_dir};
pub use crate::core::pool::PoolStats;
pub use crate::core::value::{Field, Record, Value};
pub use manager::{ApiResult, PackageManager};
pub use modules::{LogModule, MemModule};
