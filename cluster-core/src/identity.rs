//! Cluster identity: the tokens that scope and name a membership namespace.
//!
//! `cluster_key`, `environment`, `partition`, and `instance_id` are all
//! short printable-alphanumeric tokens. These are immutable once joined
//! (§3 of the spec).

use crate::error::{ClusterError, Result};

/// Maximum length of a cluster identity token (cluster key, environment,
/// partition, instance id).
pub const MAX_TOKEN_LEN: usize = 32;

/// Default environment when none is configured.
pub const DEFAULT_ENVIRONMENT: &str = "production";

/// Validate a short identity token: non-empty, `<= MAX_TOKEN_LEN`,
/// printable alphanumerics only.
pub fn validate_token(name: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > MAX_TOKEN_LEN {
        return Err(ClusterError::Invalid(format!(
            "{name} must be 1..={MAX_TOKEN_LEN} characters, got {}",
            value.len()
        )));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ClusterError::Invalid(format!(
            "{name} must be printable alphanumerics only, got {value:?}"
        )));
    }
    Ok(())
}

/// Generate a fresh instance id: a random 128-bit value rendered as 32
/// lowercase hex characters (a UUIDv4 with hyphens stripped).
pub fn generate_instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Cluster identity, set before `join` and immutable afterwards.
#[derive(Debug, Clone)]
pub struct ClusterIdentity {
    pub cluster_key: String,
    pub environment: String,
    pub partition: Option<String>,
    pub instance_id: String,
    pub registry_endpoint: Option<String>,
}

impl ClusterIdentity {
    pub fn new(cluster_key: impl Into<String>) -> Result<Self> {
        let cluster_key = cluster_key.into();
        validate_token("cluster_key", &cluster_key)?;
        Ok(Self {
            cluster_key,
            environment: DEFAULT_ENVIRONMENT.to_string(),
            partition: None,
            instance_id: generate_instance_id(),
            registry_endpoint: None,
        })
    }

    /// `/<cluster_key>[/<partition>]/<environment>` segments, in order.
    pub fn namespace_segments(&self) -> Vec<String> {
        let mut segments = vec![self.cluster_key.clone()];
        if let Some(partition) = &self.partition {
            segments.push(partition.clone());
        }
        segments.push(self.environment.clone());
        segments
    }

    /// Regenerate the instance id, used after a both-sides `fork()`.
    pub fn regenerate_instance_id(&mut self) {
        self.instance_id = generate_instance_id();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_tokens() {
        assert!(validate_token("k", "").is_err());
        assert!(validate_token("k", &"a".repeat(33)).is_err());
        assert!(validate_token("k", &"a".repeat(32)).is_ok());
    }

    #[test]
    fn rejects_non_alphanumeric_tokens() {
        assert!(validate_token("k", "foo/bar").is_err());
        assert!(validate_token("k", "foo-bar").is_err());
        assert!(validate_token("k", "fooBar123").is_ok());
    }

    #[test]
    fn generated_ids_are_32_hex_chars() {
        let id = generate_instance_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn namespace_segments_include_partition_when_set() {
        let mut id = ClusterIdentity::new("orders").unwrap();
        assert_eq!(id.namespace_segments(), vec!["orders", "production"]);
        id.partition = Some("eu".to_string());
        assert_eq!(id.namespace_segments(), vec!["orders", "eu", "production"]);
    }
}
