mod environment;
mod launch;
mod output;
mod registry;
mod signals;

pub use environment::*;
pub use launch::*;
pub use output::*;
pub use registry::*;
pub use signals::*;
