pub mod context;
mod handler;

pub use context::BoxBody;
pub use handler::{dispatch, handle_request, InboundRequest};
