//! HTTP 处理器模块

pub mod admin;
pub mod auth;
pub mod csrf;
pub mod health;
pub mod mfa;
pub mod session;
pub mod user;
