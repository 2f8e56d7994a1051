//! Least-recently-used victim selection
//!
//! Only sealed records with no outstanding references are candidates.
//! Records are taken oldest first until the requested number of bytes is
//! covered or the candidates run out.

use crate::table::ObjectRecord;
use denc::ObjectId;

/// Victims chosen for one eviction pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub victims: Vec<ObjectId>,
    pub bytes: u64,
}

pub fn choose_victims<'a>(
    records: impl Iterator<Item = &'a ObjectRecord>,
    num_bytes: u64,
) -> EvictionPlan {
    let mut plan = EvictionPlan::default();
    if num_bytes == 0 {
        return plan;
    }

    let mut candidates: Vec<&ObjectRecord> = records.filter(|r| r.is_evictable()).collect();
    candidates.sort_by_key(|r| r.last_access);

    for record in candidates {
        if plan.bytes >= num_bytes {
            break;
        }
        plan.bytes += record.footprint();
        plan.victims.push(record.object_id);
    }
    plan
}
