pub mod client;
pub mod config;
pub mod error;
pub mod refresh;
pub mod security;
pub mod session;
pub mod transport;
pub mod utils;

pub use client::AuthClient;
pub use config::ClientConfig;
pub use error::{RefreshFailure, RefreshRejected, RequestError, TransportFailure};
pub use refresh::{PendingReplay, RefreshCoordinator};
pub use session::{Role, Session, SessionStore, UserIdentity};
pub use transport::{HttpTransport, RequestDescriptor, Response, Transport};

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
