mod handlers;
mod protocol;
mod server;

pub use handlers::*;
pub use protocol::*;
pub use server::*;
