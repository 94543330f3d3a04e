//! Multi-factor authentication
//!
//! TOTP (RFC 6238, SHA-1, 6 digits, 30 s step, ±1 step) plus single-use backup
//! codes. Credentials live in the keyed store under `mfa:{user_id}`.

pub mod service;
pub mod totp;

pub use service::{MfaEnrollment, MfaService, MfaVerification};
