pub mod cli;
pub mod decode;
pub mod impls;
pub mod structs;

pub use decode::{decode_descriptor, validate_identity};
pub use structs::*;
