//! 数据模型模块
//! 账户、认证、MFA 与会话相关的请求/响应模型

pub mod account;
pub mod auth;
pub mod mfa;
pub mod session;
