//! autobatch Common Types
//!
//! Shared types used by the balancer HTTP surface and the clients that talk to
//! it (autoscaler, workers, cold-start proxies).

pub mod error;
pub mod protocol;

pub use error::{ErrorBody, ErrorDetail, ErrorKind};
pub use protocol::{BatchRequest, BatchResponse, SystemInfo};
