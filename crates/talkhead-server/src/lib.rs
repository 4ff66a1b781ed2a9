//! Talkhead Server - session service for the talkhead serving core
//!
//! Clients keep one TCP connection open and exchange newline-delimited JSON
//! with a process that has already loaded its models, so no request pays
//! startup cost.

pub mod error;
pub mod protocol;
pub mod session;
pub mod state;

pub use error::ApiError;
pub use protocol::Command;
pub use session::SessionServer;
pub use state::AppState;
