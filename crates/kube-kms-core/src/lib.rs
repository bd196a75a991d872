pub mod config;
pub mod error;
pub mod keyid;
pub mod types;

pub use error::{ErrorKind, KmsError, Result};
pub use keyid::{ConfigHash, KeyId};
