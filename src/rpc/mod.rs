//! Chain I/O: the abstract client trait and the failover endpoint pool.

pub mod client;
pub mod endpoint;
pub mod pool;
pub mod transport;

pub use client::{BlockHead, BlockStream, ChainClient, Log, LogFilter, LogStream};
pub use endpoint::{Endpoint, EndpointHealth};
pub use pool::{CallOpts, PoolEvent, RpcPool};
pub use transport::AlloyTransport;
