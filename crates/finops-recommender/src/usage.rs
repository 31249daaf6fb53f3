//! Observed resource usage.

use std::time::Duration;

use async_trait::async_trait;
use finops_core::WorkloadRef;
use serde::Deserialize;
use tracing::debug;

use crate::error::UsageError;

/// p95 usage figures for one workload.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn p95_cpu_cores(&self, namespace: &str, workload: &WorkloadRef) -> Result<f64, UsageError>;

    async fn p95_memory_bytes(
        &self,
        namespace: &str,
        workload: &WorkloadRef,
    ) -> Result<f64, UsageError>;
}

/// Instant queries against the Prometheus HTTP API.
pub struct PrometheusClient {
    client: reqwest::Client,
    base_url: String,
}

impl PrometheusClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, UsageError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Value of the first sample returned by `query`.
    pub async fn query_scalar(&self, query: &str) -> Result<f64, UsageError> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::BAD_REQUEST {
            return Err(UsageError::Status {
                status: status.as_u16(),
                url,
            });
        }
        let body: QueryResponse = response.json().await?;
        let value = body.first_value(query)?;
        debug!(%query, value, "usage sample");
        Ok(value)
    }
}

fn cpu_query(namespace: &str, workload: &WorkloadRef) -> String {
    format!(
        "quantile_over_time(0.95, sum(rate(container_cpu_usage_seconds_total{{namespace=\"{namespace}\", pod=~\"{}-.*\", container!=\"\"}}[5m]))[1d:5m])",
        workload.name
    )
}

fn memory_query(namespace: &str, workload: &WorkloadRef) -> String {
    format!(
        "quantile_over_time(0.95, sum(container_memory_working_set_bytes{{namespace=\"{namespace}\", pod=~\"{}-.*\", container!=\"\"}})[1d:5m])",
        workload.name
    )
}

#[async_trait]
impl UsageSource for PrometheusClient {
    async fn p95_cpu_cores(&self, namespace: &str, workload: &WorkloadRef) -> Result<f64, UsageError> {
        self.query_scalar(&cpu_query(namespace, workload)).await
    }

    async fn p95_memory_bytes(
        &self,
        namespace: &str,
        workload: &WorkloadRef,
    ) -> Result<f64, UsageError> {
        self.query_scalar(&memory_query(namespace, workload)).await
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<Sample>,
}

#[derive(Debug, Deserialize)]
struct Sample {
    /// `[timestamp, "value"]`
    value: (f64, String),
}

impl QueryResponse {
    fn first_value(self, query: &str) -> Result<f64, UsageError> {
        if self.status != "success" {
            return Err(UsageError::Query(
                self.error.unwrap_or_else(|| self.status.clone()),
            ));
        }
        let sample = self
            .data
            .and_then(|d| d.result.into_iter().next())
            .ok_or_else(|| UsageError::NoData(query.to_string()))?;
        let raw = sample.value.1;
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(UsageError::BadSample(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Result<f64, UsageError> {
        serde_json::from_str::<QueryResponse>(body)
            .unwrap()
            .first_value("q")
    }

    #[test]
    fn first_sample_is_used() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[
            {"metric":{},"value":[1700000000.5,"0.15"]},
            {"metric":{},"value":[1700000000.5,"9"]}
        ]}}"#;
        assert_eq!(parse(body).unwrap(), 0.15);
    }

    #[test]
    fn empty_result_is_no_data() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert!(matches!(parse(body), Err(UsageError::NoData(_))));
    }

    #[test]
    fn error_status_is_reported() {
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
        match parse(body) {
            Err(UsageError::Query(msg)) => assert_eq!(msg, "parse error"),
            other => panic!("expected query error, got {other:?}"),
        }
    }

    #[test]
    fn nan_sample_is_rejected() {
        let body = r#"{"status":"success","data":{"result":[{"value":[1,"NaN"]}]}}"#;
        assert!(matches!(parse(body), Err(UsageError::BadSample(_))));
    }

    #[test]
    fn queries_select_workload_pods() {
        let workload = WorkloadRef::deployment("nginx");
        let cpu = cpu_query("dev", &workload);
        assert!(cpu.contains("namespace=\"dev\""));
        assert!(cpu.contains("pod=~\"nginx-.*\""));
        assert!(memory_query("dev", &workload).contains("container_memory_working_set_bytes"));
    }

    #[tokio::test]
    async fn unreachable_server_is_http_error() {
        let client = PrometheusClient::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        let err = client
            .p95_cpu_cores("dev", &WorkloadRef::deployment("nginx"))
            .await
            .unwrap_err();
        assert!(matches!(err, UsageError::Http(_)));
    }
}
