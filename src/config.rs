//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use config::{Config, ConfigError, Environment};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址，例如 "0.0.0.0:3000"
    pub addr: String,
    /// 优雅关闭超时时间（秒）
    pub graceful_shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库连接 URL（使用 Secret 包装，防止日志泄露）
    pub url: Secret<String>,
    /// 最大连接数
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// 最小连接数
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// 获取连接超时时间（秒）
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    /// 空闲连接超时时间（秒）
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// 连接最大生命周期（秒）
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_lifetime() -> u64 {
    1800
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// JWT 密钥（使用 Secret 包装，防止日志泄露）
    pub jwt_secret: Secret<String>,
    /// 访问令牌过期时间（秒）
    pub access_token_exp_secs: u64,
    /// 刷新令牌过期时间（秒）
    pub refresh_token_exp_secs: u64,
    /// 密码最小长度
    pub password_min_length: usize,
    /// 密码必须包含大写字母
    pub password_require_uppercase: bool,
    /// 密码必须包含数字
    pub password_require_digit: bool,
    /// 密码必须包含特殊字符
    pub password_require_special: bool,
    /// 是否信任反向代理的转发头
    pub trust_proxy: bool,
    /// 受信任的反向代理地址，只有来自这些地址的连接才读取转发头
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
    /// Argon2 内存开销（KiB）
    #[serde(default = "default_hash_memory_kib")]
    pub password_hash_memory_kib: u32,
    /// Argon2 迭代次数
    #[serde(default = "default_hash_iterations")]
    pub password_hash_iterations: u32,
}

impl SecurityConfig {
    /// 连接地址是否为受信任的代理
    pub fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        self.trust_proxy && self.trusted_proxies.contains(&ip)
    }
}

fn default_hash_memory_kib() -> u32 {
    65536
}

fn default_hash_iterations() -> u32 {
    3
}

/// 请求安全筛查配置
#[derive(Debug, Clone, Deserialize)]
pub struct ScreenConfig {
    /// 请求体大小上限（字节）
    pub max_body_bytes: usize,
    /// 读取请求体的超时时间（毫秒）
    pub body_read_timeout_ms: u64,
    /// 固定窗口内允许的最大请求数
    pub rate_limit_max_requests: u32,
    /// 固定窗口长度（秒）
    pub rate_limit_window_secs: u64,
    /// 威胁日志最大条数
    pub threat_log_capacity: usize,
    /// 威胁记录保留时间（秒）
    pub threat_max_age_secs: u64,
    /// 启动时加入黑名单的 IP
    #[serde(default)]
    pub blocked_ips: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsrfConfig {
    /// 有状态 CSRF 令牌有效期（秒）
    pub token_ttl_secs: u64,
    /// 跳过 CSRF 校验的公开端点
    #[serde(default = "default_public_endpoints")]
    pub public_endpoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// 每个用户允许的最大并发会话数
    pub max_concurrent_sessions: usize,
    /// 会话有效期（秒）
    pub session_ttl_secs: u64,
    /// 空闲超时（秒），超过后会话失效
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MfaConfig {
    /// 认证器 App 中显示的发行方
    pub issuer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    /// 严重威胁告警 webhook（为空时只记录日志）
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// webhook 调用超时（秒）
    pub timeout_secs: u64,
}

/// 后台清理任务间隔
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    pub refresh_token_interval_secs: u64,
    pub csrf_interval_secs: u64,
    pub threat_log_interval_secs: u64,
    pub session_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// 未配置时使用内存存储
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
    pub screen: ScreenConfig,
    pub csrf: CsrfConfig,
    pub session: SessionConfig,
    pub mfa: MfaConfig,
    pub alerting: AlertingConfig,
    pub sweep: SweepConfig,
}

fn default_public_endpoints() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/api/health".to_string(),
        "/api/auth/login".to_string(),
        "/api/auth/register".to_string(),
        "/api/auth/refresh".to_string(),
        "/api/csrf-token".to_string(),
    ]
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("server.addr", "0.0.0.0:3000")?
            .set_default("server.graceful_shutdown_timeout_secs", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("security.jwt_secret", "change-this-secret-in-production-min-32-chars!")?
            .set_default("security.access_token_exp_secs", 900)?
            .set_default("security.refresh_token_exp_secs", 604800)?
            .set_default("security.password_min_length", 8)?
            .set_default("security.password_require_uppercase", true)?
            .set_default("security.password_require_digit", true)?
            .set_default("security.password_require_special", false)?
            .set_default("security.trust_proxy", false)?
            // 请求筛查默认配置
            .set_default("screen.max_body_bytes", 10 * 1024 * 1024)?
            .set_default("screen.body_read_timeout_ms", 5000)?
            .set_default("screen.rate_limit_max_requests", 100)?
            .set_default("screen.rate_limit_window_secs", 60)?
            .set_default("screen.threat_log_capacity", 1000)?
            .set_default("screen.threat_max_age_secs", 86400)?
            // CSRF 默认配置
            .set_default("csrf.token_ttl_secs", 86400)?
            .set_default("csrf.public_endpoints", default_public_endpoints())?
            // 会话默认配置
            .set_default("session.max_concurrent_sessions", 5)?
            .set_default("session.session_ttl_secs", 604800)?
            .set_default("session.idle_timeout_secs", 86400)?
            .set_default("mfa.issuer", "SecurityCore")?
            .set_default("alerting.timeout_secs", 5)?
            // 后台清理默认间隔
            .set_default("sweep.refresh_token_interval_secs", 3600)?
            .set_default("sweep.csrf_interval_secs", 3600)?
            .set_default("sweep.threat_log_interval_secs", 3600)?
            .set_default("sweep.session_interval_secs", 900)?;

        // 从环境变量加载配置（前缀为 SECURITY_）
        settings = settings.add_source(
            Environment::with_prefix("SECURITY")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("screen.blocked_ips")
                .with_list_parse_key("csrf.public_endpoints")
                .with_list_parse_key("security.trusted_proxies")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 验证端口范围
        if let Some(port_str) = self.server.addr.split(':').next_back() {
            if let Ok(port) = port_str.parse::<u16>() {
                if port != 0 && port < 1024 {
                    return Err(ConfigError::Message("Server port should be >= 1024".to_string()));
                }
            }
        }

        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        // 验证数据库连接池配置
        if let Some(database) = &self.database {
            if database.max_connections < database.min_connections {
                return Err(ConfigError::Message(
                    "max_connections must be >= min_connections".to_string(),
                ));
            }
        }

        // 验证 JWT 密钥长度（至少 32 字符）
        if self.security.jwt_secret.expose_secret().len() < 32 {
            return Err(ConfigError::Message(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        // 验证令牌过期时间
        if self.security.access_token_exp_secs < 60 || self.security.access_token_exp_secs > 86400 {
            return Err(ConfigError::Message(
                "access_token_exp_secs must be between 60 and 86400 (1 minute to 24 hours)"
                    .to_string(),
            ));
        }

        if self.security.refresh_token_exp_secs < 3600
            || self.security.refresh_token_exp_secs > 2592000
        {
            return Err(ConfigError::Message(
                "refresh_token_exp_secs must be between 3600 and 2592000 (1 hour to 30 days)"
                    .to_string(),
            ));
        }

        // 验证密码策略
        if self.security.password_min_length < 6 || self.security.password_min_length > 128 {
            return Err(ConfigError::Message(
                "password_min_length must be between 6 and 128".to_string(),
            ));
        }

        // 验证筛查配置
        if self.screen.rate_limit_max_requests == 0 || self.screen.rate_limit_window_secs == 0 {
            return Err(ConfigError::Message(
                "screen.rate_limit_max_requests and screen.rate_limit_window_secs must be > 0"
                    .to_string(),
            ));
        }

        if self.security.trust_proxy && self.security.trusted_proxies.is_empty() {
            return Err(ConfigError::Message(
                "security.trusted_proxies must list at least one proxy when trust_proxy is enabled"
                    .to_string(),
            ));
        }

        if self.screen.threat_log_capacity == 0 {
            return Err(ConfigError::Message(
                "screen.threat_log_capacity must be > 0".to_string(),
            ));
        }

        if self.screen.body_read_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "screen.body_read_timeout_ms must be > 0".to_string(),
            ));
        }

        // 验证会话上限
        if self.session.max_concurrent_sessions < 1 || self.session.max_concurrent_sessions > 100 {
            return Err(ConfigError::Message(
                "session.max_concurrent_sessions must be between 1 and 100".to_string(),
            ));
        }

        if self.session.idle_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "session.idle_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.csrf.token_ttl_secs < 60 {
            return Err(ConfigError::Message(
                "csrf.token_ttl_secs must be >= 60".to_string(),
            ));
        }

        Ok(())
    }

    /// 测试与本地开发使用的默认配置（不读取环境变量）
    pub fn for_testing() -> Self {
        AppConfig {
            server: ServerConfig {
                addr: "127.0.0.1:0".to_string(),
                graceful_shutdown_timeout_secs: 5,
            },
            database: None,
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
            security: SecurityConfig {
                jwt_secret: Secret::new("test-secret-key-for-testing-only-min-32-chars".to_string()),
                access_token_exp_secs: 900,
                refresh_token_exp_secs: 604800,
                password_min_length: 8,
                password_require_uppercase: true,
                password_require_digit: true,
                password_require_special: false,
                trust_proxy: true,
                trusted_proxies: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
                password_hash_memory_kib: 1024,
                password_hash_iterations: 1,
            },
            screen: ScreenConfig {
                max_body_bytes: 1024 * 1024,
                body_read_timeout_ms: 2000,
                rate_limit_max_requests: 100,
                rate_limit_window_secs: 60,
                threat_log_capacity: 1000,
                threat_max_age_secs: 86400,
                blocked_ips: vec![],
            },
            csrf: CsrfConfig {
                token_ttl_secs: 86400,
                public_endpoints: default_public_endpoints(),
            },
            session: SessionConfig {
                max_concurrent_sessions: 5,
                session_ttl_secs: 604800,
                idle_timeout_secs: 86400,
            },
            mfa: MfaConfig {
                issuer: "SecurityCore".to_string(),
            },
            alerting: AlertingConfig {
                webhook_url: None,
                timeout_secs: 5,
            },
            sweep: SweepConfig {
                refresh_token_interval_secs: 3600,
                csrf_interval_secs: 3600,
                threat_log_interval_secs: 3600,
                session_interval_secs: 900,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_defaults() {
        // 清理所有可能的环境变量
        std::env::remove_var("SECURITY_SERVER__ADDR");
        std::env::remove_var("SECURITY_LOGGING__LEVEL");
        std::env::remove_var("SECURITY_SCREEN__RATE_LIMIT_MAX_REQUESTS");

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.server.addr, "0.0.0.0:3000");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.security.access_token_exp_secs, 900);
        assert_eq!(config.screen.rate_limit_max_requests, 100);
        assert_eq!(config.screen.rate_limit_window_secs, 60);
        assert_eq!(config.csrf.token_ttl_secs, 86400);
        assert!(config.csrf.public_endpoints.contains(&"/api/health".to_string()));
        assert!(config.database.is_none());
        assert!(!config.security.trust_proxy);
        assert!(config.security.trusted_proxies.is_empty());
    }

    #[test]
    #[serial]
    fn test_config_validation_invalid_port() {
        std::env::set_var("SECURITY_SERVER__ADDR", "0.0.0.0:80");

        let result = AppConfig::from_env();
        assert!(result.is_err());

        std::env::remove_var("SECURITY_SERVER__ADDR");
    }

    #[test]
    #[serial]
    fn test_config_validation_invalid_log_level() {
        std::env::set_var("SECURITY_LOGGING__LEVEL", "invalid");

        let result = AppConfig::from_env();
        assert!(result.is_err());

        std::env::remove_var("SECURITY_LOGGING__LEVEL");
    }

    #[test]
    fn test_testing_config_is_valid() {
        assert!(AppConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_trust_proxy_requires_proxy_list() {
        let mut config = AppConfig::for_testing();
        config.security.trusted_proxies.clear();
        assert!(config.validate().is_err());

        config.security.trust_proxy = false;
        assert!(config.validate().is_ok());

        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(!config.security.is_trusted_proxy(loopback));
        config.security.trust_proxy = true;
        config.security.trusted_proxies.push(loopback);
        assert!(config.security.is_trusted_proxy(loopback));
        assert!(!config.security.is_trusted_proxy("10.0.0.1".parse().unwrap()));
    }

    #[test]
    #[serial]
    fn test_trusted_proxies_from_env() {
        std::env::set_var("SECURITY_SECURITY__TRUST_PROXY", "true");
        std::env::set_var("SECURITY_SECURITY__TRUSTED_PROXIES", "10.0.0.5,10.0.0.6");

        let result = AppConfig::from_env();

        std::env::remove_var("SECURITY_SECURITY__TRUST_PROXY");
        std::env::remove_var("SECURITY_SECURITY__TRUSTED_PROXIES");

        let config = result.unwrap();
        assert_eq!(config.security.trusted_proxies.len(), 2);
        assert!(config.security.is_trusted_proxy("10.0.0.6".parse().unwrap()));
    }

    #[test]
    fn test_zero_session_cap_rejected() {
        let mut config = AppConfig::for_testing();
        config.session.max_concurrent_sessions = 0;
        assert!(config.validate().is_err());
    }
}
