mod ann;
mod backfill;
mod digest;
mod embedding_table;
mod fragments;
mod host;
mod locks;
mod maintenance;
mod registry;
mod search;
mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use ann::*;
pub use backfill::*;
pub use digest::*;
pub use embedding_table::*;
pub use fragments::*;
pub use host::*;
pub use locks::{KeyedGuard, KeyedLocks};
pub use maintenance::*;
pub use registry::*;
pub use search::*;
pub use store::*;
