//! The assignment algorithm (§4.3, C6): a deterministic, pure mapping from
//! a sorted snapshot of live members to this instance's worker-index base
//! and the cluster-wide worker total.

use crate::record::MembershipRecord;

/// Result of a single assignment pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    /// `-1` when this instance is not present in the snapshot (or is
    /// passive).
    pub inst_index: i64,
    pub total_workers: i64,
}

/// Compute `(inst_index, total_workers)` for `instance_id` from a snapshot
/// of non-expired membership records.
///
/// Records are sorted by `instance_id` ascending and walked in order,
/// accumulating `worker_count`. A record whose `worker_count` is
/// non-positive is included in the total but never claims an index range.
/// A passive instance is never assigned an index even if it appears in the
/// snapshot (stale record / bug), but it still is not special-cased out of
/// the total -- the passive caller simply never publishes a record for
/// itself, so in practice it never appears here.
pub fn assign(snapshot: &[MembershipRecord], instance_id: &str, passive: bool) -> Assignment {
    let mut sorted: Vec<&MembershipRecord> = snapshot.iter().collect();
    sorted.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    let mut accum: i64 = 0;
    let mut inst_index: i64 = -1;

    for record in sorted {
        if record.instance_id == instance_id && !passive {
            inst_index = accum;
        }
        accum += record.worker_count;
    }

    Assignment {
        inst_index,
        total_workers: accum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, workers: i64) -> MembershipRecord {
        MembershipRecord::new(id.to_string(), workers, Utc::now(), 120)
    }

    #[test]
    fn partitions_contiguously_in_ascii_id_order() {
        let snapshot = vec![record("bbbb", 3), record("aaaa", 2)];

        let a = assign(&snapshot, "aaaa", false);
        assert_eq!(a.inst_index, 0);
        assert_eq!(a.total_workers, 5);

        let b = assign(&snapshot, "bbbb", false);
        assert_eq!(b.inst_index, 2);
        assert_eq!(b.total_workers, 5);
    }

    #[test]
    fn absent_instance_gets_negative_one() {
        let snapshot = vec![record("aaaa", 2), record("bbbb", 3)];
        let unseen = assign(&snapshot, "cccc", false);
        assert_eq!(unseen.inst_index, -1);
        assert_eq!(unseen.total_workers, 5);
    }

    #[test]
    fn passive_instance_never_claims_an_index() {
        let snapshot = vec![record("aaaa", 2), record("bbbb", 3), record("pppp", 0)];
        let passive = assign(&snapshot, "pppp", true);
        assert_eq!(passive.inst_index, -1);
        assert_eq!(passive.total_workers, 5);

        // other instances are unaffected by the passive joiner.
        let a = assign(&snapshot, "aaaa", false);
        assert_eq!(a.inst_index, 0);
        assert_eq!(a.total_workers, 5);
    }

    #[test]
    fn non_positive_worker_counts_contribute_zero_and_claim_nothing() {
        let snapshot = vec![record("aaaa", 0), record("bbbb", 3)];
        let a = assign(&snapshot, "aaaa", false);
        assert_eq!(a.inst_index, 0);
        let b = assign(&snapshot, "bbbb", false);
        assert_eq!(b.inst_index, 0);
        assert_eq!(b.total_workers, 3);
    }

    #[test]
    fn departure_compacts_remaining_indices() {
        let with_b = vec![record("aaaa", 2), record("bbbb", 3)];
        let a_before = assign(&with_b, "aaaa", false);
        assert_eq!((a_before.inst_index, a_before.total_workers), (0, 5));

        let without_b = vec![record("aaaa", 2)];
        let a_after = assign(&without_b, "aaaa", false);
        assert_eq!((a_after.inst_index, a_after.total_workers), (0, 2));
    }

    proptest::proptest! {
        #[test]
        fn ranges_are_disjoint_and_cover_the_total(
            ids in proptest::collection::vec("[a-z]{4,8}", 1..12usize),
            workers in proptest::collection::vec(1i64..10, 1..12usize),
        ) {
            let mut ids = ids;
            ids.sort();
            ids.dedup();
            let n = ids.len().min(workers.len());
            let snapshot: Vec<MembershipRecord> = ids[..n]
                .iter()
                .zip(workers[..n].iter())
                .map(|(id, w)| record(id, *w))
                .collect();

            let mut expected_start = 0i64;
            for rec in snapshot.iter() {
                let a = assign(&snapshot, &rec.instance_id, false);
                proptest::prop_assert_eq!(a.inst_index, expected_start);
                expected_start += rec.worker_count;
            }
            let total: i64 = snapshot.iter().map(|r| r.worker_count).sum();
            for rec in snapshot.iter() {
                let a = assign(&snapshot, &rec.instance_id, false);
                proptest::prop_assert_eq!(a.total_workers, total);
            }
        }
    }
}
