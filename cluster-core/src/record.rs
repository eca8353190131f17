//! The published Membership Record (§3, §4.2) and its two wire encodings.

use chrono::{DateTime, Utc};

/// Format used for all record timestamps, both backends.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One instance's published membership record, as read back from a
/// registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipRecord {
    pub instance_id: String,
    pub worker_count: i64,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MembershipRecord {
    pub fn new(instance_id: String, worker_count: i64, updated_at: DateTime<Utc>, ttl_seconds: u64) -> Self {
        let expires_at = updated_at + chrono::Duration::seconds(ttl_seconds as i64);
        Self {
            instance_id,
            worker_count,
            updated_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Directory (etcd-style) back-end value encoding: the decimal ASCII of
/// `worker_count`. TTL and timestamps are handled by the directory service
/// itself, not encoded in the value.
pub fn encode_directory_value(worker_count: i64) -> String {
    worker_count.to_string()
}

pub fn decode_directory_value(value: &str) -> Option<i64> {
    value.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_encoding_round_trips() {
        assert_eq!(decode_directory_value(&encode_directory_value(7)), Some(7));
        assert_eq!(decode_directory_value(&encode_directory_value(0)), Some(0));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(decode_directory_value("not-a-number"), None);
    }

    #[test]
    fn expiry_invariant_matches_ttl() {
        let now = Utc::now();
        let record = MembershipRecord::new("abc".to_string(), 2, now, 120);
        assert_eq!(record.expires_at, now + chrono::Duration::seconds(120));
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + chrono::Duration::seconds(121)));
    }
}
