//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::config::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    pub addr: SocketAddr,
}

/// 初始化 Prometheus 指标导出
///
/// 在指定端口启动 `/metrics` 监听，需要在 tokio 运行时内调用。
pub async fn init(service_name: &str, config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", service_name)
        .install()?;

    register_engine_metrics();

    info!("Metrics server listening on {}", addr);
    Ok(MetricsHandle { addr })
}

/// 注册规则引擎指标描述
///
/// 这些描述会出现在 /metrics 端点的 HELP 注释中
fn register_engine_metrics() {
    metrics::describe_counter!(
        "geofence_rule_evaluations_total",
        "Total number of rule evaluations"
    );
    metrics::describe_counter!("geofence_events_total", "Total number of fired events");
    metrics::describe_counter!(
        "geofence_rule_errors_total",
        "Total number of rule evaluations aborted by an error"
    );
    metrics::describe_histogram!(
        "geofence_detect_duration_seconds",
        "Per-device detection duration in seconds"
    );
}
