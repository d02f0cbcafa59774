pub mod harness;
pub mod predict;
pub mod stats;

pub use harness::*;
pub use predict::*;
pub use stats::*;
