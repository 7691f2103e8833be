mod assemble;
mod chroot;

pub use assemble::*;
pub use chroot::*;
