use crate::attempt::Status;
use crate::tree::AttemptTree;

pub const MAX_RECONCILE_PASSES: usize = 30;

/// Propagates RUN and DONE from restart attempts up to their ancestors until
/// nothing changes. Terminal parents and the synthetic root are left alone.
/// Returns the number of passes taken.
pub fn reconcile(tree: &mut AttemptTree) -> usize {
    let nodes = tree.nodes_mut();
    let mut passes = 0;
    while passes < MAX_RECONCILE_PASSES {
        passes += 1;
        let mut changed = false;
        for id in 1..nodes.len() {
            let status = nodes[id].status;
            if !matches!(status, Status::Run | Status::Done) {
                continue;
            }
            let Some(parent_id) = nodes[id].parent_id else {
                continue;
            };
            let parent = &mut nodes[parent_id];
            if parent.is_root() || parent.status == status || parent.status.is_terminal() {
                continue;
            }
            tracing::debug!(
                attempt_id = parent_id,
                from = %parent.status,
                to = %status,
                "reconciled parent status"
            );
            parent.status = status;
            changed = true;
        }
        if !changed {
            break;
        }
    }
    passes
}
