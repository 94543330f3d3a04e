//! Session and admin request models

use serde::Deserialize;
use validator::Validate;

/// Admin: add an IP to the denylist
#[derive(Debug, Deserialize, Validate)]
pub struct BlockIpRequest {
    #[validate(length(min = 2, max = 64))]
    pub ip: String,
    #[validate(length(max = 256))]
    pub reason: Option<String>,
}

/// Admin: lock an account
#[derive(Debug, Deserialize, Validate)]
pub struct LockAccountRequest {
    #[validate(length(min = 1, max = 256))]
    pub reason: String,
}

/// Admin: recent threats query
#[derive(Debug, Deserialize)]
pub struct ThreatQuery {
    pub limit: Option<usize>,
}
