pub mod kernel;

pub use kernel::*;
