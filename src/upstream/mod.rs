pub mod pool;

pub use pool::{BackendError, BackendPool, BackendRequest, BackendResponse, Destination};
