pub mod connector;
pub mod entry;
pub mod registry;

pub use connector::connect_upstream;
pub use entry::{EndpointKey, PooledConnection};
pub use registry::{ConnectionPool, PoolSnapshot};
