use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use super::grouper::DedupGrouper;
use super::types::{
    CleanupAction, CleanupPlan, DeleteReason, DuplicateGroup, FileEntry, IgnoreReason,
    SkipReason, TempReason,
};

/// Everything the planner needs, as produced by the earlier stages.
#[derive(Debug, Default)]
pub struct PlanInputs {
    pub temporaries: Vec<(FileEntry, TempReason)>,
    pub ignored: Vec<(FileEntry, IgnoreReason)>,
    pub groups: Vec<DuplicateGroup>,
    /// Duplicate candidates that turned out to have no twin.
    pub unique: Vec<FileEntry>,
    pub hard_links: Vec<(FileEntry, PathBuf)>,
    pub unreadable: Vec<FileEntry>,
}

pub struct CleanupPlanner<'g> {
    grouper: &'g DedupGrouper,
}

impl<'g> CleanupPlanner<'g> {
    pub fn new(grouper: &'g DedupGrouper) -> Self {
        Self { grouper }
    }

    /// Build the ordered plan. Each path appears exactly once; order is by path.
    pub fn plan(&self, root: &Path, inputs: PlanInputs) -> CleanupPlan {
        let mut actions: BTreeMap<PathBuf, CleanupAction> = BTreeMap::new();

        let temp_paths: HashSet<PathBuf> = inputs
            .temporaries
            .iter()
            .map(|(entry, _)| entry.path.clone())
            .collect();

        for (entry, reason) in inputs.temporaries {
            insert(
                &mut actions,
                CleanupAction::Delete {
                    entry,
                    reason: DeleteReason::Temporary(reason),
                },
            );
        }

        for group in inputs.groups {
            // Temporary files are leaving anyway and never take part in keep-selection.
            let mut members: Vec<FileEntry> = group
                .members
                .into_iter()
                .filter(|m| !temp_paths.contains(&m.path))
                .collect();
            members.sort_by(|a, b| self.grouper.keep_order(a, b));

            if members.len() < 2 {
                for entry in members {
                    insert(
                        &mut actions,
                        CleanupAction::Skip {
                            entry,
                            reason: SkipReason::UniqueContent,
                        },
                    );
                }
                continue;
            }

            let mut iter = members.into_iter();
            let Some(keep) = iter.next() else { continue };
            let kept_path = keep.path.clone();
            insert(
                &mut actions,
                CleanupAction::Skip {
                    entry: keep,
                    reason: SkipReason::KeptOriginal,
                },
            );
            for entry in iter {
                insert(
                    &mut actions,
                    CleanupAction::Delete {
                        entry,
                        reason: DeleteReason::DuplicateOf(kept_path.clone()),
                    },
                );
            }
        }

        for (entry, reason) in inputs.ignored {
            insert(
                &mut actions,
                CleanupAction::Skip {
                    entry,
                    reason: SkipReason::Ignored(reason),
                },
            );
        }
        for entry in inputs.unique {
            insert(
                &mut actions,
                CleanupAction::Skip {
                    entry,
                    reason: SkipReason::UniqueContent,
                },
            );
        }
        // A link whose representative is being deduplicated goes with it; otherwise
        // the inode would survive and resurface as a duplicate on the next run.
        for (entry, rep) in inputs.hard_links {
            let action = match actions.get(&rep) {
                Some(CleanupAction::Delete {
                    reason: DeleteReason::DuplicateOf(kept),
                    ..
                }) => CleanupAction::Delete {
                    entry,
                    reason: DeleteReason::DuplicateOf(kept.clone()),
                },
                _ => CleanupAction::Skip {
                    entry,
                    reason: SkipReason::HardLinkOf(rep),
                },
            };
            insert(&mut actions, action);
        }
        for entry in inputs.unreadable {
            insert(
                &mut actions,
                CleanupAction::Skip {
                    entry,
                    reason: SkipReason::Unreadable,
                },
            );
        }

        let plan = CleanupPlan {
            root: root.to_path_buf(),
            actions: actions.into_values().collect(),
        };
        log::info!(
            "Plan ready: {} deletions ({} bytes), {} skips",
            plan.delete_count(),
            plan.bytes_to_free(),
            plan.actions.len() - plan.delete_count()
        );
        plan
    }
}

/// Temporary deletion beats keeping an original, which beats duplicate deletion.
fn rank(action: &CleanupAction) -> u8 {
    match action {
        CleanupAction::Delete {
            reason: DeleteReason::Temporary(_),
            ..
        } => 3,
        CleanupAction::Skip {
            reason: SkipReason::KeptOriginal,
            ..
        } => 2,
        CleanupAction::Delete { .. } => 1,
        CleanupAction::Skip { .. } => 0,
    }
}

fn insert(actions: &mut BTreeMap<PathBuf, CleanupAction>, action: CleanupAction) {
    let path = action.path().to_path_buf();
    match actions.get(&path) {
        Some(existing) if rank(existing) >= rank(&action) => {}
        _ => {
            actions.insert(path, action);
        }
    }
}
