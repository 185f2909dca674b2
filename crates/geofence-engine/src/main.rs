//! 地理围栏引擎服务
//!
//! 从标准输入逐行读取设备快照（JSON），将触发的事件逐行写到标准输出。

use anyhow::{Context, Result};
use geofence_engine::{Device, Engine, MemoryObjectStore, RuleSpec};
use geofence_shared::config::AppConfig;
use geofence_shared::observability;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 统一加载配置：从 config/{service_name}.toml 加载，包含可观测性配置
    let config = AppConfig::load("geofence-engine").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    let service_name = if config.service_name.is_empty() {
        "geofence-engine"
    } else {
        config.service_name.as_str()
    };
    let _guard = observability::init(service_name, &config.observability).await?;

    info!("Starting geofence-engine...");

    let engine = Arc::new(Engine::with_config(
        config.engine.clone(),
        Arc::new(MemoryObjectStore::new()),
    ));

    if let Some(path) = &config.engine.rules_file {
        match load_rules(&engine, path).await {
            Ok(count) => info!("Loaded {} rules from {}", count, path),
            Err(e) => warn!("Failed to load rules from {}: {:#}, starting empty", path, e),
        }
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let device: Device = match serde_json::from_str(&line) {
            Ok(device) => device,
            Err(e) => {
                warn!(error = %e, "Skipping malformed device snapshot");
                continue;
            }
        };

        // 评估是同步的纯内存计算
        let events = match engine.detect(&cancel, device) {
            Ok(events) => events,
            Err(e) if cancel.is_cancelled() => {
                info!("Detection interrupted: {}", e);
                break;
            }
            Err(e) => {
                warn!(error = %e, "Device update rejected");
                continue;
            }
        };
        for event in events {
            let mut out = serde_json::to_vec(&event)?;
            out.push(b'\n');
            stdout.write_all(&out).await?;
        }
        stdout.flush().await?;
    }

    let stats = engine.stats();
    info!(
        rules = stats.rules_count,
        devices = stats.devices_count,
        states = stats.states_count,
        "Service shutdown complete"
    );
    Ok(())
}

/// 从 JSON 文件批量注册规则
async fn load_rules(engine: &Engine, path: &str) -> Result<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {path}"))?;
    let specs: Vec<RuleSpec> = serde_json::from_str(&raw).context("parsing rule file")?;
    let ids = engine.register_batch(specs)?;
    Ok(ids.len())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
