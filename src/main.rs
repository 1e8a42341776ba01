use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::{error, info, warn};

mod app;
mod shutdown;

use app::{AppMode, Application};
use scheduler_core::{init_logging, AppConfig, ObservabilityConfig};
use shutdown::{wait_for_signal, ShutdownManager};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式工作流调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，不指定时使用默认配置和环境变量"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["master", "worker", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker ID，覆盖配置文件中的值"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件中的值")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件中的值")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = AppConfig::load(config_path.map(String::as_str))
        .with_context(|| format!("加载配置失败: {config_path:?}"))?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    if let Some(id) = matches.get_one::<String>("worker-id") {
        config.worker.worker_id = id.clone();
    }

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    let mode = AppMode::parse(
        matches
            .get_one::<String>("mode")
            .map(String::as_str)
            .unwrap_or("all"),
    )?;
    info!("启动分布式工作流调度系统，模式: {:?}", mode);
    if let Some(path) = config_path {
        info!("配置文件: {}", path);
    }

    init_metrics(&config.observability)?;

    let app = Application::new(config, mode)?;
    let shutdown = ShutdownManager::new();
    let mut app_handle = tokio::spawn(app.run(shutdown.clone()));

    tokio::select! {
        result = wait_for_signal() => {
            result?;
        }
        // 组件启动失败时应用会提前返回
        result = &mut app_handle => {
            shutdown.shutdown();
            return match result {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("应用异常退出: {e}")),
            };
        }
    }

    info!("收到关闭信号，开始优雅关闭...");
    shutdown.shutdown();

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, app_handle).await {
        Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
        Ok(Ok(Err(e))) => error!("应用关闭时发生错误: {:#}", e),
        Ok(Err(e)) => error!("应用异常退出: {}", e),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("分布式工作流调度系统已退出");
    Ok(())
}

/// 启用时在配置的地址上暴露 Prometheus 指标
fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }

    let address: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_bind_address))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus指标导出器失败: {e}"))?;

    info!("Prometheus指标导出器监听于 {}", address);
    Ok(())
}
