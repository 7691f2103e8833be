mod fixture_init;

#[allow(unused_imports)]
pub use fixture_init::*;
