//! Authentication and authorization module

pub mod jwt;
pub mod middleware;
pub mod password;

pub use jwt::{AccessVerification, Claims, RotateOutcome, TokenOrigin, TokenPair, TokenService};
pub use middleware::{
    admin_only_middleware, extract_token, jwt_auth_middleware, mfa_gate_middleware, AuthContext,
};
pub use password::{validate_password_policy, PasswordHasher};
