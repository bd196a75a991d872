pub mod grpc;
pub mod handler;
pub mod health;
pub mod key_cache;
pub mod lifecycle;
pub mod socket;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use handler::{HandlerOptions, KmsHandler};
pub use lifecycle::{Lifecycle, ServingState};
