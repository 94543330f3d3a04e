//! Business logic services layer

pub mod auth_service;
pub mod session_policy;

pub use auth_service::{AuthService, ClientInfo};
pub use session_policy::{Session, SessionInfo, SessionPolicy, SessionValidation};
