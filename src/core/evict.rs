//! Purpose: Choose which unreferenced sealed objects to evict without performing any I/O.
//! Exports: `EvictionCandidate`, `EvictionPlan`, `plan_eviction`.
//! Role: Pure policy layer; the client probes references, plans here, then applies.
//! Invariants: Only candidates passed in can be chosen; callers pass unreferenced sealed objects.
//! Invariants: Oldest seal first, object id as tie-break; output depends only on inputs.
use crate::core::object_id::ObjectId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EvictionCandidate {
    pub object_id: ObjectId,
    pub bytes: u64,
    pub sealed_ns: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EvictionPlan {
    pub victims: Vec<EvictionCandidate>,
    pub bytes: u64,
}

impl EvictionPlan {
    pub fn satisfies(&self, target_bytes: u64) -> bool {
        self.bytes >= target_bytes
    }
}

pub fn plan_eviction(candidates: &[EvictionCandidate], target_bytes: u64) -> EvictionPlan {
    let mut ordered = candidates.to_vec();
    ordered.sort_by(|a, b| {
        a.sealed_ns
            .cmp(&b.sealed_ns)
            .then_with(|| a.object_id.cmp(&b.object_id))
    });

    let mut plan = EvictionPlan::default();
    for candidate in ordered {
        if plan.bytes >= target_bytes {
            break;
        }
        plan.bytes += candidate.bytes;
        plan.victims.push(candidate);
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::{EvictionCandidate, plan_eviction};
    use crate::core::object_id::ObjectId;

    fn candidate(tag: u8, bytes: u64, sealed_ns: u64) -> EvictionCandidate {
        EvictionCandidate {
            object_id: ObjectId::new([tag; 20]),
            bytes,
            sealed_ns,
        }
    }

    #[test]
    fn oldest_sealed_go_first() {
        let candidates = [candidate(1, 10, 300), candidate(2, 10, 100), candidate(3, 10, 200)];
        let plan = plan_eviction(&candidates, 15);
        let victims: Vec<u8> = plan.victims.iter().map(|c| c.object_id.as_bytes()[0]).collect();
        assert_eq!(victims, vec![2, 3]);
        assert_eq!(plan.bytes, 20);
        assert!(plan.satisfies(15));
    }

    #[test]
    fn zero_target_evicts_nothing() {
        let plan = plan_eviction(&[candidate(1, 10, 1)], 0);
        assert!(plan.victims.is_empty());
        assert_eq!(plan.bytes, 0);
    }

    #[test]
    fn insufficient_candidates_report_partial_bytes() {
        let plan = plan_eviction(&[candidate(1, 4, 1), candidate(2, 5, 2)], 100);
        assert_eq!(plan.victims.len(), 2);
        assert_eq!(plan.bytes, 9);
        assert!(!plan.satisfies(100));
    }

    #[test]
    fn ties_break_on_object_id() {
        let plan = plan_eviction(&[candidate(9, 1, 5), candidate(4, 1, 5)], 1);
        assert_eq!(plan.victims[0].object_id, ObjectId::new([4; 20]));
    }
}
