//! 安全核心服务主入口

use futures::FutureExt;
use security_core::{
    config::AppConfig,
    db,
    handlers::health,
    middleware::AppState,
    routes,
    scheduler::{SweepJob, SweepScheduler},
    store::{PgStore, Store},
    telemetry,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("security-core {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 加载 .env 文件（开发环境）
    // 按优先级加载：.env.local > .env.development > .env
    if let Ok(env) = std::env::var("SECURITY_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::from_filename(".env.development").ok();
        dotenv::dotenv().ok();
    }

    health::set_start_time();

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志
    telemetry::init_telemetry(&config);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Security core starting...");

    // 3. 存储：配置了数据库时使用 Postgres，否则使用内存
    let (store, db_pool) = match &config.database {
        Some(database) => {
            let pool = db::connect(database).await?;
            tracing::info!("Using Postgres store");
            (Store::new(Arc::new(PgStore::new(pool.clone()))), Some(pool))
        }
        None => {
            tracing::warn!("No database configured, using in-memory store");
            (Store::in_memory(), None)
        }
    };

    // 4. 构建应用状态
    let shutdown_timeout = Duration::from_secs(config.server.graceful_shutdown_timeout_secs);
    let addr = config.server.addr.clone();
    let state = AppState::build(config, store, db_pool)?;

    // 5. 后台清理任务
    let sweeps = start_sweeps(&state);
    tracing::info!(jobs = sweeps.len(), "Background sweeps started");

    // 6. 启动服务器
    let app = routes::create_router(state);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!(addr = %addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // 7. 停止后台任务
    if tokio::time::timeout(shutdown_timeout, sweeps.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Background sweeps did not stop before the shutdown timeout");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn sweep_job<F, Fut>(job: F) -> SweepJob
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<u64>> + Send + 'static,
{
    Arc::new(move || job().boxed())
}

/// 启动所有周期性清理任务
fn start_sweeps(state: &Arc<AppState>) -> SweepScheduler {
    let intervals = &state.config.sweep;
    let mut scheduler = SweepScheduler::new();

    let tokens = state.tokens.clone();
    scheduler.spawn(
        "refresh_tokens",
        Duration::from_secs(intervals.refresh_token_interval_secs),
        sweep_job(move || {
            let tokens = tokens.clone();
            async move { Ok(tokens.sweep_expired().await?) }
        }),
    );

    let csrf = state.csrf.clone();
    scheduler.spawn(
        "csrf_tokens",
        Duration::from_secs(intervals.csrf_interval_secs),
        sweep_job(move || {
            let csrf = csrf.clone();
            async move { Ok(csrf.sweep_expired().await?) }
        }),
    );

    let screen = state.screen.clone();
    scheduler.spawn(
        "threat_log",
        Duration::from_secs(intervals.threat_log_interval_secs),
        sweep_job(move || {
            let screen = screen.clone();
            async move { Ok(screen.sweep()) }
        }),
    );

    let sessions = state.sessions.clone();
    scheduler.spawn(
        "sessions",
        Duration::from_secs(intervals.session_interval_secs),
        sweep_job(move || {
            let sessions = sessions.clone();
            async move { Ok(sessions.sweep().await?) }
        }),
    );

    let store = state.store.clone();
    scheduler.spawn(
        "store_ttl",
        Duration::from_secs(intervals.session_interval_secs),
        sweep_job(move || {
            let store = store.clone();
            async move { Ok(store.purge_expired().await?) }
        }),
    );

    scheduler
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }
}

/// 打印帮助信息
fn print_help() {
    println!("security-core {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: security-core [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 SECURITY_ 前缀的环境变量完成");
    println!("  SECURITY_SERVER__ADDR            监听地址（默认 0.0.0.0:3000）");
    println!("  SECURITY_SECURITY__JWT_SECRET    JWT 签名密钥（至少 32 字符）");
    println!("  SECURITY_DATABASE__URL           PostgreSQL 连接串（未设置时使用内存存储）");
    println!("  SECURITY_LOGGING__LEVEL          日志级别");
}
