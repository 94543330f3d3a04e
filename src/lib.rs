//! 安全核心库
//! 令牌生命周期、MFA、CSRF、请求安全筛查与会话/账户策略

pub mod alerting;
pub mod auth;
pub mod config;
pub mod csrf;
pub mod db;
pub mod error;
pub mod handlers;
pub mod mfa;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod response;
pub mod routes;
pub mod scheduler;
pub mod screen;
pub mod services;
pub mod store;
pub mod telemetry;
