mod logging;
mod validation;
mod vector;

pub use logging::*;
pub use validation::*;
pub use vector::*;
