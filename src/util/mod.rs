mod drop_privileges;
mod expand_home;
mod mkdir;
mod mount;

pub use drop_privileges::*;
pub use expand_home::*;
pub use mkdir::*;
pub use mount::*;
