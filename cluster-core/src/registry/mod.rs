//! The Registry Adapter capability (§4.1, C1): the narrow interface the
//! core requires from a backing coordination service, plus the two
//! concrete backends (directory/etcd-style, relational).
//!
//! Selected at runtime by the `registry_endpoint` URI scheme: absent picks
//! the static backend (handled entirely in [`crate::lifecycle`], no
//! adapter involved); `http[s]://` picks [`directory::DirectoryAdapter`];
//! any other scheme picks [`relational::RelationalAdapter`].

pub mod directory;
pub mod relational;

use crate::error::Result;
use crate::record::MembershipRecord;
use async_trait::async_trait;
use std::sync::Arc;

/// How long the relational back-end's emulated long-poll sleeps between
/// checks for row changes (§4.1).
pub const BALANCE_SLEEP_SECONDS: u64 = 5;

/// Force a relational balance pass at least this often even with no
/// observed row changes, to catch silent expirations (§4.5 step 6).
pub const MAX_BALANCE_WAIT_SECONDS: u64 = 30;

/// An opaque, idempotently-opened namespace. Both backends derive their
/// own routing (a directory path, or `(key, env, partition)` filter
/// columns) from the same three segments.
#[derive(Debug, Clone)]
pub struct Namespace {
    pub cluster_key: String,
    pub partition: Option<String>,
    pub environment: String,
}

impl Namespace {
    pub fn new(cluster_key: impl Into<String>, partition: Option<String>, environment: impl Into<String>) -> Self {
        Self {
            cluster_key: cluster_key.into(),
            partition,
            environment: environment.into(),
        }
    }

    /// `/<cluster_key>[/<partition>]/<environment>`, used by the directory
    /// adapter as a literal path and by logging everywhere else.
    pub fn path(&self) -> String {
        match &self.partition {
            Some(partition) => format!("/{}/{}/{}", self.cluster_key, partition, self.environment),
            None => format!("/{}/{}", self.cluster_key, self.environment),
        }
    }
}

/// Capability the core consumes from a registry back-end. Two transports
/// implement it: an HTTP/etcd-style directory service, and a relational
/// database.
#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    /// Idempotent: create the namespace if absent, open it if present.
    async fn open_namespace(&self, namespace: &Namespace) -> Result<()>;

    /// Overwrite `key` with `value`, expiring after `ttl_seconds`. When
    /// `must_exist` is true, fail if the key is absent -- this is how
    /// refreshes detect eviction.
    async fn put_with_ttl(
        &self,
        namespace: &Namespace,
        key: &str,
        value: i64,
        ttl_seconds: u64,
        must_exist: bool,
    ) -> Result<()>;

    /// Best-effort delete.
    async fn delete(&self, namespace: &Namespace, key: &str) -> Result<()>;

    /// Snapshot of every non-expired record in the namespace.
    async fn list(&self, namespace: &Namespace) -> Result<Vec<MembershipRecord>>;

    /// Block until some descendant of `namespace` changes, or return
    /// promptly with an error for recoverable failures. Safe to invoke
    /// concurrently with `put_with_ttl` on the same namespace -- each call
    /// uses its own transport.
    async fn wait_for_change(&self, namespace: &Namespace) -> Result<()>;
}

/// Back-end selected at `join`, based on `registry_endpoint`'s URI scheme.
pub enum Backend {
    /// No registry: indices are fixed by configuration.
    Static,
    Dynamic(Arc<dyn RegistryAdapter>),
}

/// Select a back-end from the configured registry endpoint. `None` (no
/// endpoint configured) selects the static back-end.
pub fn select_backend(registry_endpoint: Option<&str>) -> Result<Backend> {
    let Some(endpoint) = registry_endpoint else {
        return Ok(Backend::Static);
    };

    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(Backend::Dynamic(Arc::new(directory::DirectoryAdapter::new(
            endpoint.to_string(),
        )?)))
    } else {
        Ok(Backend::Dynamic(Arc::new(relational::RelationalAdapter::connect_lazy(
            endpoint,
        )?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_endpoint_selects_static() {
        assert!(matches!(select_backend(None).unwrap(), Backend::Static));
    }

    #[test]
    fn http_endpoint_selects_directory() {
        assert!(matches!(
            select_backend(Some("http://localhost:2379")).unwrap(),
            Backend::Dynamic(_)
        ));
    }

    #[test]
    fn other_scheme_selects_relational() {
        assert!(matches!(
            select_backend(Some("postgres://localhost/cluster")).unwrap(),
            Backend::Dynamic(_)
        ));
    }

    #[test]
    fn namespace_path_nests_partition() {
        let ns = Namespace::new("orders", Some("eu".to_string()), "production");
        assert_eq!(ns.path(), "/orders/eu/production");
        let ns = Namespace::new("orders", None, "production");
        assert_eq!(ns.path(), "/orders/production");
    }
}
