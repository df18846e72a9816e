//! Pure merge planner.
//!
//! Takes full local and remote snapshots plus the last sync point and
//! decides, without touching any store, what to apply locally, what to
//! push, and which conflicts to record. Keeping this pure makes the
//! conflict rules testable row by row.

use std::collections::{HashMap, HashSet};

use packrat_core::models::{
    Category, Conflict, ConflictKind, EntityKind, Item, Location, SyncStatus,
};

/// Timestamps closer than this are treated as the same write. Devices that
/// synced the same edit disagree by clock skew, not by intent.
pub const CLOCK_SKEW_MS: i64 = 1000;

/// Everything the planner looks at.
pub struct MergeInput<'a> {
    pub local_items: &'a [Item],
    pub remote_items: &'a [Item],
    pub local_categories: &'a [Category],
    pub remote_categories: &'a [Category],
    pub local_locations: &'a [Location],
    pub remote_locations: &'a [Location],
    /// Last successful pass (Unix ms); `None` means never synced.
    pub last_sync_at: Option<i64>,
    /// Item ids with a queued local delete.
    pub pending_deletes: &'a [i64],
}

/// What a merge pass must do. Outputs are ordered so the same input always
/// produces the same plan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergePlan {
    /// Remote-only categories to append locally (local wins name ties).
    pub add_categories: Vec<Category>,
    pub add_locations: Vec<Location>,
    /// Remote rows to write over local state (remote wins / remote-only).
    /// Ids are already remapped to the matching local row where one exists.
    pub apply_remote_items: Vec<Item>,
    /// Local item ids whose photos must be pushed before the table write.
    pub upload_items: Vec<i64>,
    pub conflicts: Vec<Conflict>,
}

pub fn plan_merge(input: &MergeInput<'_>) -> MergePlan {
    let mut plan = MergePlan::default();
    let last_sync = input.last_sync_at.unwrap_or(0);

    // Categories and locations: case-insensitive union, local wins ties.
    let local_category_names: HashSet<String> = input
        .local_categories
        .iter()
        .map(|category| category.name.to_lowercase())
        .collect();
    plan.add_categories = input
        .remote_categories
        .iter()
        .filter(|category| !local_category_names.contains(&category.name.to_lowercase()))
        .cloned()
        .collect();
    plan.add_categories.sort_by(|a, b| a.name.cmp(&b.name));

    let local_location_names: HashSet<String> = input
        .local_locations
        .iter()
        .map(|location| location.name.to_lowercase())
        .collect();
    plan.add_locations = input
        .remote_locations
        .iter()
        .filter(|location| !local_location_names.contains(&location.name.to_lowercase()))
        .cloned()
        .collect();
    plan.add_locations.sort_by(|a, b| a.name.cmp(&b.name));

    // Items match by id first, then by case-insensitive name.
    let remote_by_id: HashMap<i64, usize> = input
        .remote_items
        .iter()
        .enumerate()
        .map(|(index, item)| (item.id, index))
        .collect();
    let remote_by_name: HashMap<String, usize> = input
        .remote_items
        .iter()
        .enumerate()
        .map(|(index, item)| (item.name.to_lowercase(), index))
        .collect();

    let mut matched_remote: HashSet<usize> = HashSet::new();

    for local in input.local_items {
        let remote_index = remote_by_id
            .get(&local.id)
            .or_else(|| remote_by_name.get(&local.name.to_lowercase()))
            .copied();

        let Some(remote_index) = remote_index else {
            // Absent remotely. A previously synced item means someone
            // deleted it on another device; the local copy still wins and
            // goes back up, but the disagreement is recorded.
            if local.synced_at.is_some() {
                plan.conflicts.push(Conflict {
                    entity: EntityKind::Item,
                    entity_id: local.id,
                    local: serde_json::to_value(local).unwrap_or_default(),
                    remote: serde_json::Value::Null,
                    kind: ConflictKind::DeletedRemotely,
                });
            }
            plan.upload_items.push(local.id);
            continue;
        };

        matched_remote.insert(remote_index);
        let remote = &input.remote_items[remote_index];

        let local_touched = local.updated_at > last_sync;
        let remote_touched = remote.updated_at > last_sync;
        let delta = (local.updated_at - remote.updated_at).abs();

        if local_touched && remote_touched && delta > CLOCK_SKEW_MS {
            // Real divergence: last write wins, and the loser is recorded.
            plan.conflicts.push(Conflict {
                entity: EntityKind::Item,
                entity_id: local.id,
                local: serde_json::to_value(local).unwrap_or_default(),
                remote: serde_json::to_value(remote).unwrap_or_default(),
                kind: ConflictKind::BothModified,
            });
            if local.updated_at > remote.updated_at {
                plan.upload_items.push(local.id);
            } else {
                let mut winner = remote.clone();
                winner.id = local.id;
                plan.apply_remote_items.push(winner);
            }
        } else if local_touched && remote_touched {
            // Within skew tolerance: same write seen from two clocks.
            // Local is kept and no conflict is raised.
            if local.sync_status == SyncStatus::Pending {
                plan.upload_items.push(local.id);
            }
        } else if remote_touched {
            let mut incoming = remote.clone();
            incoming.id = local.id;
            plan.apply_remote_items.push(incoming);
        } else if local_touched || local.sync_status == SyncStatus::Pending {
            plan.upload_items.push(local.id);
        }
    }

    // Remote-only items come down, unless a queued local delete says the
    // item was removed here; deletion wins by omission from the next
    // overwrite.
    for (index, remote) in input.remote_items.iter().enumerate() {
        if matched_remote.contains(&index) {
            continue;
        }
        if input.pending_deletes.contains(&remote.id) {
            plan.conflicts.push(Conflict {
                entity: EntityKind::Item,
                entity_id: remote.id,
                local: serde_json::Value::Null,
                remote: serde_json::to_value(remote).unwrap_or_default(),
                kind: ConflictKind::DeletedLocally,
            });
            continue;
        }
        plan.apply_remote_items.push(remote.clone());
    }

    plan.apply_remote_items.sort_by_key(|item| item.id);
    plan.upload_items.sort_unstable();
    plan.conflicts.sort_by_key(|conflict| conflict.entity_id);
    plan
}
