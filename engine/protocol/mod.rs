pub mod binary;
pub mod framing;
pub mod handshake;
pub mod http;
pub mod messages;
pub mod pool;
pub mod server;

pub use framing::*;
pub use messages::*;
pub use pool::*;
pub use server::*;
