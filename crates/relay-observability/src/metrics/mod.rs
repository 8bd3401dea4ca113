//! 指标收集模块
//!
//! 基于 metrics 库的指标记录器。未安装 recorder 时所有记录均为空操作。

use metrics::{describe_counter, describe_gauge, Unit};

use crate::config::Config;

/// 指标描述注册器；recorder 由二进制另行安装
#[derive(Debug)]
pub struct MetricsCollector {
    enabled: bool,
}

impl MetricsCollector {
    /// 按配置注册所有指标描述
    pub fn new(config: &Config) -> Self {
        if config.metrics_enabled {
            register_descriptions();
            tracing::debug!(target: "relay_observability", "Metric descriptions registered");
        }
        Self {
            enabled: config.metrics_enabled,
        }
    }

    /// 是否注册了指标描述
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

fn register_descriptions() {
    describe_counter!(
        "relay_requests_completed_total",
        Unit::Count,
        "Requests completed by a matching response"
    );
    describe_counter!(
        "relay_requests_timed_out_total",
        Unit::Count,
        "Requests completed by their timeout"
    );
    describe_counter!(
        "relay_requests_cancelled_total",
        Unit::Count,
        "Requests failed because their connection closed"
    );
    describe_counter!(
        "relay_responses_orphaned_total",
        Unit::Count,
        "Responses with no pending request"
    );
    describe_counter!(
        "relay_reconnect_attempts_total",
        Unit::Count,
        "Reconnect attempts by side"
    );
    describe_counter!(
        "relay_auth_failures_total",
        Unit::Count,
        "Authentication failures by side"
    );
    describe_gauge!(
        "relay_sessions_active",
        Unit::Count,
        "Number of server-side sessions"
    );
    describe_counter!(
        "relay_dispatch_total",
        Unit::Count,
        "Dispatched requests by outcome"
    );
    describe_counter!(
        "relay_contexts_swept_total",
        Unit::Count,
        "Streaming contexts evicted by the sweeper"
    );
    describe_counter!(
        "relay_events_unresolved_total",
        Unit::Count,
        "Agent events dropped without a context"
    );
    describe_counter!(
        "relay_messages_total",
        Unit::Count,
        "Bridged messages by direction and outcome"
    );
}

/// 请求关联指标记录器
pub struct RequestMetrics;

impl RequestMetrics {
    /// 记录正常完成
    pub fn record_completed() {
        metrics::counter!("relay_requests_completed_total").increment(1);
    }

    /// 记录超时
    pub fn record_timeout() {
        metrics::counter!("relay_requests_timed_out_total").increment(1);
    }

    /// 记录连接关闭导致的取消
    pub fn record_cancelled(count: usize) {
        metrics::counter!("relay_requests_cancelled_total").increment(count as u64);
    }

    /// 记录无人等待的响应
    pub fn record_orphaned() {
        metrics::counter!("relay_responses_orphaned_total").increment(1);
    }
}

/// 连接指标记录器
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// 记录重连尝试
    pub fn record_reconnect(side: &'static str) {
        metrics::counter!("relay_reconnect_attempts_total", "side" => side).increment(1);
    }

    /// 记录认证失败
    pub fn record_auth_failure(side: &'static str) {
        metrics::counter!("relay_auth_failures_total", "side" => side).increment(1);
    }
}

/// Session 指标记录器
pub struct SessionMetrics;

impl SessionMetrics {
    /// 设置活跃会话数
    pub fn set_active(count: usize) {
        metrics::gauge!("relay_sessions_active").set(count as f64);
    }
}

/// 分发指标记录器
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// 记录一次分发结果
    pub fn record(outcome: &'static str) {
        metrics::counter!("relay_dispatch_total", "outcome" => outcome).increment(1);
    }
}

/// 流式上下文指标记录器
pub struct ContextMetrics;

impl ContextMetrics {
    /// 记录清理数量
    pub fn record_swept(count: usize) {
        metrics::counter!("relay_contexts_swept_total").increment(count as u64);
    }

    /// 记录无法解析的事件
    pub fn record_unresolved() {
        metrics::counter!("relay_events_unresolved_total").increment(1);
    }
}

/// 桥接消息指标记录器
pub struct BridgeMetrics;

impl BridgeMetrics {
    /// 记录一条消息，direction 为 "inbound" 或 "outbound"
    pub fn record_message(direction: &'static str, outcome: &'static str) {
        metrics::counter!("relay_messages_total", "direction" => direction, "outcome" => outcome)
            .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_init() {
        assert!(!MetricsCollector::new(&Config::default()).is_enabled());
        let enabled = Config {
            metrics_enabled: true,
            ..Config::default()
        };
        assert!(MetricsCollector::new(&enabled).is_enabled());
    }

    #[test]
    fn test_recorders_without_recorder_are_noops() {
        RequestMetrics::record_completed();
        RequestMetrics::record_cancelled(3);
        ConnectionMetrics::record_reconnect("im");
        DispatchMetrics::record("not_found");
        BridgeMetrics::record_message("inbound", "filtered");
    }
}
