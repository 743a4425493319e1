mod definitions;
mod embeddings;
mod flags;
mod fragments;
mod legacy;
mod pool;
mod strategies;
mod types;

pub use definitions::*;
pub use embeddings::*;
pub use flags::*;
pub use fragments::*;
pub use legacy::*;
pub use pool::*;
pub use strategies::*;
pub use types::*;
