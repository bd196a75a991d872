pub mod errors;
pub mod local;
pub mod provider;
pub mod vault;

pub mod factory;

#[cfg(feature = "aws-kms")]
pub mod aws_kms;

pub use factory::{BackendHandle, create_backend};
pub use local::LocalBackend;
pub use provider::KmsBackend;
