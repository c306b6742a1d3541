//! How much of the instruction log survives pruning.

use std::time::Duration;

use cachesync_id::InstructionId;
use cachesync_log::PruneThreshold;
use chrono::{DateTime, TimeDelta, Utc};

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Which records are old enough to be pruned.
///
/// The margin must cover the lag of the slowest server of the farm: a server whose watermark
/// record gets pruned has to cold boot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Records whose timestamp is older than this.
    MaxAge(Duration),
    /// Records more than this many ids behind the newest one.
    IdDistance(u64),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::MaxAge(DEFAULT_MAX_AGE)
    }
}

impl RetentionPolicy {
    /// The rows a server whose watermark is `own_last_id` may delete right now, or `None` if
    /// there is nothing it may delete.
    ///
    /// Whatever the policy, only ids strictly below both `max_id` and `own_last_id` qualify, so
    /// the newest record and the pruning server's own watermark record always survive.
    pub fn threshold(
        &self,
        now: DateTime<Utc>,
        max_id: InstructionId,
        own_last_id: InstructionId,
    ) -> Option<PruneThreshold> {
        let bound = max_id.min(own_last_id);
        let (below_id, older_than) = match self {
            Self::MaxAge(age) => {
                let age = TimeDelta::from_std(*age).ok()?;
                (bound, Some(now.checked_sub_signed(age)?))
            }
            Self::IdDistance(distance) => (bound.min(max_id.saturating_sub(*distance)), None),
        };
        (!below_id.is_none()).then_some(PruneThreshold {
            below_id,
            older_than,
        })
    }
}
