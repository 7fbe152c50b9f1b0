//! MemoryStore - プロセス内の key/value ストア
//!
//! テストやデモ用の Dependency。`memory_data_api` で `get` / `set` を持つ
//! DataApi をすぐに作れます。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::app::DataApi;
use crate::domain::{LeaseHandle, TaskerError};
use crate::ports::Dependency;

/// Payload of a [`MemoryStore`] lease.
#[derive(Debug, Clone)]
pub struct MemoryStoreHandle {
    state: Arc<Mutex<Map<String, Value>>>,
}

impl MemoryStoreHandle {
    pub fn get(&self, key: &str) -> Value {
        self.state.lock().get(key).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.state.lock().insert(key.into(), value);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<Map<String, Value>>>,
}

impl MemoryStore {
    pub fn new(initial: Map<String, Value>) -> Self {
        Self {
            state: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.state.lock().clone()
    }
}

#[async_trait]
impl Dependency for MemoryStore {
    fn default_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn request_resource(&self, _timeout: Duration) -> Result<LeaseHandle, TaskerError> {
        Ok(LeaseHandle::detached(MemoryStoreHandle {
            state: Arc::clone(&self.state),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct SetParams {
    key: String,
    value: Value,
}

/// A DataApi over a fresh [`MemoryStore`] registered as dependency `store`.
///
/// - source `get`: params is the key (string), returns the value or null
/// - target `set`: params is `{"key": .., "value": ..}`, returns null
pub fn memory_data_api(name: impl Into<String>, initial: Map<String, Value>) -> Arc<DataApi> {
    DataApi::builder(name)
        .dependency("store", Arc::new(MemoryStore::new(initial)))
        .source("get", |ctx, params| async move {
            let key: String = serde_json::from_value(params)?;
            let lease = ctx.request_resource("store", None).await?;
            Ok(lease.payload::<MemoryStoreHandle>()?.get(&key))
        })
        .target("set", |ctx, params| async move {
            let SetParams { key, value } = serde_json::from_value(params)?;
            let lease = ctx.request_resource("store", None).await?;
            lease.payload::<MemoryStoreHandle>()?.set(key, value);
            Ok(Value::Null)
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_through_the_api() {
        let mut initial = Map::new();
        initial.insert("count".into(), json!(1));
        let api = memory_data_api("mem", initial);

        assert_eq!(api.call_source_api("get", json!("count")).await.unwrap(), json!(1));
        api.call_target_api("set", json!({"key": "count", "value": 2}))
            .await
            .unwrap();
        assert_eq!(api.call_source::<u32>("get", "count").await.unwrap(), 2);
        assert_eq!(api.call_source_api("get", json!("missing")).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn malformed_params_are_codec_errors() {
        let api = memory_data_api("mem", Map::new());
        let err = api.call_target_api("set", json!(42)).await.unwrap_err();
        assert!(matches!(err, TaskerError::Codec(_)));
    }
}
