mod barrier;
mod xpra;

pub use barrier::*;
pub use xpra::*;
