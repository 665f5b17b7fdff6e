//! In-memory key/value backend.
//!
//! Stands in for a real database in tests, benchmarks and the `simulate`
//! command. Each [`MemoryBackend`] is one replica's copy of a table; its
//! liveness can be switched off, upcoming calls can be made to fail with a
//! transient error, and every call can be slowed down.
//!
//! Queries ([`MemoryQuery`], row-returning):
//! - `{"get": "key"}` returns the value or `null`
//! - `{"scan": "prefix"}` returns an object of every matching entry
//! - `{"count": null}` returns the number of entries
//!
//! Statements ([`MemoryStatement`], non-row-returning):
//! - `{"set": "key", "value": <any>}`
//! - `{"delete": "key"}`
//!
//! Statements return `{"affected": n}`.

use async_trait::async_trait;
use qbalance_common::{
    Backend, BackendError, BackendFamily, Executor, Output, Payload, TelemetryMetric,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub struct MemoryBackend {
    family: BackendFamily,
    table: Mutex<BTreeMap<String, Value>>,
    online: AtomicBool,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
    calls: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            family: BackendFamily::Generic,
            table: Mutex::new(BTreeMap::new()),
            online: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_family(mut self, family: BackendFamily) -> Self {
        self.family = family;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// While offline every call fails with an operational error and `ping` returns `false`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Makes the next `count` calls fail with an operational error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Calls that reached the table (failed calls are not counted).
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.table().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    async fn call<T>(
        &self,
        op: impl FnOnce(&mut BTreeMap<String, Value>) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        if !self.is_online() {
            return Err(BackendError::Operational("connection refused".to_string()));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BackendError::Operational(
                "connection reset by peer".to_string(),
            ));
        }

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let result = op(&mut self.table());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        result
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn family(&self) -> BackendFamily {
        self.family
    }

    async fn ping(&self) -> bool {
        self.is_online()
    }

    async fn measure(&self, metric: TelemetryMetric) -> Result<f64, BackendError> {
        if !self.is_online() {
            return Err(BackendError::Operational("connection refused".to_string()));
        }
        Ok(match metric {
            TelemetryMetric::Latency => self.latency_ms.load(Ordering::SeqCst) as f64,
            TelemetryMetric::Connections => self.in_flight.load(Ordering::SeqCst) as f64,
        })
    }
}

fn key_of<'a>(payload: &'a Payload, field: &str) -> Option<&'a str> {
    payload.get(field).and_then(Value::as_str)
}

/// Row-returning executor for [`MemoryBackend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryQuery;

#[async_trait]
impl Executor<MemoryBackend> for MemoryQuery {
    async fn execute(
        &self,
        payload: &Payload,
        backend: &MemoryBackend,
    ) -> Result<Output, BackendError> {
        if let Some(key) = key_of(payload, "get") {
            let key = key.to_string();
            return backend
                .call(move |table| Ok(table.get(&key).cloned().unwrap_or(Value::Null)))
                .await;
        }
        if let Some(prefix) = key_of(payload, "scan") {
            let prefix = prefix.to_string();
            return backend
                .call(move |table| {
                    let rows: Map<String, Value> = table
                        .range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    Ok(Value::Object(rows))
                })
                .await;
        }
        if payload.get("count").is_some() {
            return backend.call(|table| Ok(json!(table.len()))).await;
        }
        Err(BackendError::Programming(format!(
            "unsupported query: {}",
            payload
        )))
    }
}

/// Non-row-returning executor for [`MemoryBackend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStatement;

#[async_trait]
impl Executor<MemoryBackend> for MemoryStatement {
    async fn execute(
        &self,
        payload: &Payload,
        backend: &MemoryBackend,
    ) -> Result<Output, BackendError> {
        if let Some(key) = key_of(payload, "set") {
            let value = payload
                .get("value")
                .cloned()
                .ok_or_else(|| BackendError::Data(format!("missing value for key {}", key)))?;
            let key = key.to_string();
            return backend
                .call(move |table| {
                    table.insert(key, value);
                    Ok(json!({"affected": 1}))
                })
                .await;
        }
        if let Some(key) = key_of(payload, "delete") {
            let key = key.to_string();
            return backend
                .call(move |table| {
                    let affected = usize::from(table.remove(&key).is_some());
                    Ok(json!({"affected": affected}))
                })
                .await;
        }
        Err(BackendError::Programming(format!(
            "unsupported statement: {}",
            payload
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = MemoryBackend::new();
        let affected = MemoryStatement
            .execute(&json!({"set": "a", "value": 1}), &backend)
            .await
            .unwrap();
        assert_eq!(affected, json!({"affected": 1}));
        assert_eq!(
            MemoryQuery.execute(&json!({"get": "a"}), &backend).await.unwrap(),
            json!(1)
        );
        assert_eq!(
            MemoryStatement
                .execute(&json!({"delete": "a"}), &backend)
                .await
                .unwrap(),
            json!({"affected": 1})
        );
        assert_eq!(
            MemoryQuery.execute(&json!({"get": "a"}), &backend).await.unwrap(),
            Value::Null
        );
        assert_eq!(backend.calls(), 4);
    }

    #[tokio::test]
    async fn test_scan_and_count() {
        let backend = MemoryBackend::new();
        for (k, v) in [("user:1", 1), ("user:2", 2), ("order:1", 3)] {
            MemoryStatement
                .execute(&json!({"set": k, "value": v}), &backend)
                .await
                .unwrap();
        }
        let rows = MemoryQuery
            .execute(&json!({"scan": "user:"}), &backend)
            .await
            .unwrap();
        assert_eq!(rows, json!({"user:1": 1, "user:2": 2}));
        let count = MemoryQuery
            .execute(&json!({"count": null}), &backend)
            .await
            .unwrap();
        assert_eq!(count, json!(3));
    }

    #[tokio::test]
    async fn test_offline_and_injected_failures_are_operational() {
        let backend = MemoryBackend::new();
        backend.fail_next(1);
        let err = MemoryQuery
            .execute(&json!({"get": "a"}), &backend)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Operational(_)));
        assert!(MemoryQuery.execute(&json!({"get": "a"}), &backend).await.is_ok());

        backend.set_online(false);
        assert!(!backend.ping().await);
        assert!(MemoryQuery.execute(&json!({"get": "a"}), &backend).await.is_err());
        assert!(backend.measure(TelemetryMetric::Latency).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_payloads() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            MemoryQuery.execute(&json!({"drop": "x"}), &backend).await,
            Err(BackendError::Programming(_))
        ));
        assert!(matches!(
            MemoryStatement.execute(&json!({"set": "x"}), &backend).await,
            Err(BackendError::Data(_))
        ));
    }

    #[tokio::test]
    async fn test_measure_reports_configured_latency() {
        let backend = MemoryBackend::new().with_latency(Duration::from_millis(7));
        assert_eq!(backend.measure(TelemetryMetric::Latency).await.unwrap(), 7.0);
        assert_eq!(backend.measure(TelemetryMetric::Connections).await.unwrap(), 0.0);
    }
}
