//! HashiCorp Vault Transit backend.

pub mod auth;
pub mod client;
pub mod session;
pub mod transit;

pub use auth::{AppRoleAuthenticator, TokenAuthenticator};
pub use client::VaultClient;
pub use session::{Authenticator, LoginToken, SessionToken, VaultSession};
pub use transit::VaultTransitBackend;
