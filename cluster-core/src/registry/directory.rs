//! Directory (HTTP/etcd-style) registry adapter.
//!
//! Maps the [`RegistryAdapter`] capability onto an etcd v2-style
//! hierarchical key-value service: `PUT .../key?ttl=N&prevExist=bool`,
//! `DELETE .../key`, a recursive `GET` for listing, and a long-poll `GET
//! ...?wait=true&recursive=true&waitIndex=N` for change notification.
//!
//! The `waitIndex` bookmark is tracked per namespace so a wake is never
//! missed between two `wait_for_change` calls (grounded in the original
//! implementation's `etcd.c`, which re-arms `waitIndex` to
//! `modifiedIndex + 1` after every wake).

use super::{Namespace, RegistryAdapter};
use crate::error::{ClusterError, Result};
use crate::record::MembershipRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(default, rename = "modifiedIndex")]
    modified_index: Option<u64>,
    #[serde(default)]
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    #[serde(default)]
    node: Option<EtcdNode>,
    #[serde(default, rename = "errorCode")]
    error_code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

/// etcd's "key not found" error code; used by the ping loop's
/// `must_exist=false` fallback path (§4.4 step 3).
const ETCD_KEY_NOT_FOUND: i64 = 100;

pub struct DirectoryAdapter {
    client: reqwest::Client,
    base_url: String,
    /// `waitIndex` bookmark per namespace path.
    cursors: Arc<Mutex<HashMap<String, u64>>>,
}

impl DirectoryAdapter {
    pub fn new(base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ClusterError::Adapter(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cursors: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn keys_url(&self, namespace: &Namespace, key: Option<&str>) -> String {
        match key {
            Some(key) => format!("{}/v2/keys{}/{}", self.base_url, namespace.path(), key),
            None => format!("{}/v2/keys{}", self.base_url, namespace.path()),
        }
    }

    fn leaf_to_record(node: &EtcdNode) -> Option<MembershipRecord> {
        let instance_id = node.key.rsplit('/').next()?.to_string();
        let worker_count = crate::record::decode_directory_value(node.value.as_deref()?)?;
        let expires_at: DateTime<Utc> = node
            .expiration
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Some(MembershipRecord {
            instance_id,
            worker_count,
            // The directory service enforces TTL server-side; the exact
            // publish time is not recoverable from a listing and is not
            // load-bearing for liveness, which is decided by `expires_at`.
            updated_at: expires_at,
            expires_at,
        })
    }
}

#[async_trait]
impl RegistryAdapter for DirectoryAdapter {
    async fn open_namespace(&self, namespace: &Namespace) -> Result<()> {
        let url = self.keys_url(namespace, None);
        self.client
            .put(&url)
            .form(&[("dir", "true")])
            .send()
            .await?;
        // Idempotent: etcd returns 403 if the directory already exists,
        // which is not an error for our purposes.
        Ok(())
    }

    async fn put_with_ttl(
        &self,
        namespace: &Namespace,
        key: &str,
        value: i64,
        ttl_seconds: u64,
        must_exist: bool,
    ) -> Result<()> {
        let url = self.keys_url(namespace, Some(key));
        let value_str = crate::record::encode_directory_value(value);
        let ttl_str = ttl_seconds.to_string();
        let mut form: Vec<(&str, &str)> = vec![("value", value_str.as_str()), ("ttl", ttl_str.as_str())];
        // `prevExist` is etcd's compare-and-swap guard; omitting it entirely
        // means create-or-overwrite. Sending `prevExist=false` would instead
        // mean "fail if the key already exists" -- the opposite of what an
        // initial, unconditional ping needs. Only refreshes (`must_exist`)
        // assert the key is still there.
        if must_exist {
            form.push(("prevExist", "true"));
        }
        let response = self.client.put(&url).form(&form).send().await?;

        if response.status().is_success() {
            return Ok(());
        }

        let parsed: EtcdResponse = response
            .json()
            .await
            .unwrap_or(EtcdResponse { node: None, error_code: None, message: None });
        Err(ClusterError::Adapter(
            parsed
                .message
                .unwrap_or_else(|| "registry rejected put_with_ttl".to_string()),
        ))
    }

    async fn delete(&self, namespace: &Namespace, key: &str) -> Result<()> {
        let url = self.keys_url(namespace, Some(key));
        let _ = self.client.delete(&url).send().await;
        Ok(())
    }

    async fn list(&self, namespace: &Namespace) -> Result<Vec<MembershipRecord>> {
        let url = self.keys_url(namespace, None);
        let response = self
            .client
            .get(&url)
            .query(&[("recursive", "true")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(Vec::new());
        }

        let parsed: EtcdResponse = response.json().await?;
        let Some(node) = parsed.node else {
            return Ok(Vec::new());
        };

        Ok(node.nodes.iter().filter_map(Self::leaf_to_record).collect())
    }

    async fn wait_for_change(&self, namespace: &Namespace) -> Result<()> {
        let path = namespace.path();
        let wait_index = {
            let cursors = self.cursors.lock().await;
            cursors.get(&path).copied()
        };

        let url = self.keys_url(namespace, None);
        let mut request = self
            .client
            .get(&url)
            .query(&[("wait", "true"), ("recursive", "true")]);
        if let Some(index) = wait_index {
            request = request.query(&[("waitIndex", index.to_string())]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let parsed: EtcdResponse = response
                .json()
                .await
                .unwrap_or(EtcdResponse { node: None, error_code: None, message: None });
            if parsed.error_code == Some(ETCD_KEY_NOT_FOUND) {
                return Ok(());
            }
            return Err(ClusterError::Adapter(
                parsed.message.unwrap_or_else(|| "watch failed".to_string()),
            ));
        }

        let parsed: EtcdResponse = response.json().await?;
        if let Some(node) = &parsed.node {
            if let Some(modified_index) = node.modified_index {
                let mut cursors = self.cursors.lock().await;
                cursors.insert(path, modified_index + 1);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn list_parses_leaf_nodes_into_records() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "node": {
                "key": "/orders/production",
                "dir": true,
                "nodes": [
                    {"key": "/orders/production/aaaa", "value": "2", "modifiedIndex": 5, "expiration": "2999-01-01T00:00:00Z"},
                    {"key": "/orders/production/bbbb", "value": "3", "modifiedIndex": 6, "expiration": "2999-01-01T00:00:00Z"}
                ]
            }
        });
        Mock::given(method("GET"))
            .and(path_regex(r"^/v2/keys/orders/production$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let adapter = DirectoryAdapter::new(server.uri()).unwrap();
        let ns = Namespace::new("orders", None, "production");
        let records = adapter.list(&ns).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].instance_id, "aaaa");
        assert_eq!(records[0].worker_count, 2);
    }

    #[tokio::test]
    async fn put_with_ttl_surfaces_rejection_as_adapter_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/v2/keys/orders/production/aaaa$"))
            .respond_with(ResponseTemplate::new(412).set_body_json(serde_json::json!({
                "errorCode": 101,
                "message": "Compare failed"
            })))
            .mount(&server)
            .await;

        let adapter = DirectoryAdapter::new(server.uri()).unwrap();
        let ns = Namespace::new("orders", None, "production");
        let result = adapter.put_with_ttl(&ns, "aaaa", 2, 120, true).await;
        assert!(matches!(result, Err(ClusterError::Adapter(_))));
    }
}
