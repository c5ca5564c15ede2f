pub mod client;
pub mod error;
pub mod framing;
pub mod pool;
pub mod tls;

pub use client::{
    ClientConnection,
    ClientHandler,
    HandlerKind,
    HttpRequest,
};
pub use error::TransportError;
pub use pool::{
    ConnectionPool,
    PoolConfig,
};
