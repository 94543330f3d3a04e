//! MFA request models

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Code submission (TOTP or backup code)
#[derive(Debug, Deserialize, Validate)]
pub struct MfaCodeRequest {
    #[validate(length(min = 6, max = 16))]
    pub code: String,
}

/// Disable request, needs the account password again
#[derive(Debug, Deserialize, Validate)]
pub struct MfaDisableRequest {
    #[validate(length(min = 1, max = 128))]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct MfaStatusResponse {
    pub enabled: bool,
    pub backup_codes_remaining: usize,
}
