use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub auth_failures: u64,
    pub total_response_time: Duration,
    pub last_request_time: Option<SystemTime>,
    pub requests_by_endpoint: HashMap<String, EndpointMetrics>,
}

impl ApiMetrics {
    pub fn average_response_time(&self) -> Duration {
        if self.total_requests == 0 {
            Duration::from_millis(0)
        } else {
            self.total_response_time / self.total_requests as u32
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointMetrics {
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub total_response_time: Duration,
    pub min_response_time: Duration,
    pub max_response_time: Duration,
}

#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub endpoint: String,
    pub status_code: Option<u16>,
    pub response_time: Duration,
    pub success: bool,
    pub rate_limited: bool,
    pub error_type: Option<String>,
}

impl EndpointMetrics {
    fn new() -> Self {
        Self {
            request_count: 0,
            success_count: 0,
            error_count: 0,
            total_response_time: Duration::from_millis(0),
            min_response_time: Duration::MAX,
            max_response_time: Duration::from_millis(0),
        }
    }

    fn update(&mut self, metrics: &RequestMetrics) {
        self.request_count += 1;
        self.total_response_time += metrics.response_time;
        self.min_response_time = self.min_response_time.min(metrics.response_time);
        self.max_response_time = self.max_response_time.max(metrics.response_time);

        if metrics.success {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
    }

    pub fn average_response_time(&self) -> Duration {
        if self.request_count == 0 {
            Duration::from_millis(0)
        } else {
            self.total_response_time / self.request_count as u32
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.request_count as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    metrics: RwLock<ApiMetrics>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_request(&self, request_metrics: RequestMetrics) {
        let mut metrics = self.metrics.write().await;

        metrics.total_requests += 1;
        metrics.last_request_time = Some(SystemTime::now());
        metrics.total_response_time += request_metrics.response_time;

        if request_metrics.success {
            metrics.successful_requests += 1;
        } else {
            metrics.failed_requests += 1;
        }
        if request_metrics.rate_limited {
            metrics.rate_limited_requests += 1;
        }
        if request_metrics.status_code == Some(401) {
            metrics.auth_failures += 1;
        }

        metrics
            .requests_by_endpoint
            .entry(request_metrics.endpoint.clone())
            .or_insert_with(EndpointMetrics::new)
            .update(&request_metrics);
    }

    pub async fn get_metrics(&self) -> ApiMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn get_endpoint_metrics(&self, endpoint: &str) -> Option<EndpointMetrics> {
        let metrics = self.metrics.read().await;
        metrics.requests_by_endpoint.get(endpoint).cloned()
    }

    pub async fn reset_metrics(&self) {
        let mut metrics = self.metrics.write().await;
        *metrics = ApiMetrics::default();
    }

    pub async fn export_metrics(&self) -> Result<String, serde_json::Error> {
        let metrics = self.get_metrics().await;
        serde_json::to_string_pretty(&metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(endpoint: &str, status: u16, millis: u64) -> RequestMetrics {
        RequestMetrics {
            endpoint: endpoint.to_string(),
            status_code: Some(status),
            response_time: Duration::from_millis(millis),
            success: (200..300).contains(&status),
            rate_limited: status == 429,
            error_type: None,
        }
    }

    #[tokio::test]
    async fn test_metrics_collection() {
        let collector = MetricsCollector::new();
        collector.record_request(request("/r/rust/new", 200, 150)).await;
        collector.record_request(request("/r/rust/new", 429, 50)).await;
        collector.record_request(request("/r/rust/new", 401, 40)).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 2);
        assert_eq!(metrics.rate_limited_requests, 1);
        assert_eq!(metrics.auth_failures, 1);
        assert_eq!(metrics.average_response_time(), Duration::from_millis(80));
        assert!(metrics.last_request_time.is_some());
    }

    #[tokio::test]
    async fn test_endpoint_metrics() {
        let collector = MetricsCollector::new();
        collector.record_request(request("/r/rust/new", 200, 100)).await;
        collector.record_request(request("/r/rust/new", 200, 300)).await;

        let metrics = collector.get_endpoint_metrics("/r/rust/new").await.unwrap();
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.success_rate(), 1.0);
        assert_eq!(metrics.min_response_time, Duration::from_millis(100));
        assert_eq!(metrics.max_response_time, Duration::from_millis(300));
        assert_eq!(metrics.average_response_time(), Duration::from_millis(200));

        assert!(collector.get_endpoint_metrics("/r/other/new").await.is_none());
    }

    #[tokio::test]
    async fn test_export_and_reset() {
        let collector = MetricsCollector::new();
        collector.record_request(request("/r/rust/new", 200, 150)).await;

        let exported = collector.export_metrics().await.unwrap();
        assert!(exported.contains("total_requests"));

        collector.reset_metrics().await;
        assert_eq!(collector.get_metrics().await.total_requests, 0);
    }
}
