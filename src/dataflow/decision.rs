use crate::dataflow::frame::{Frame, FrameValue};
use crate::ir::EdgeKind;
use crate::vna::{ValueNumber, ValueNumberFrame};

/// Refinement of one congruence class on the two outgoing edges of a branch.
///
/// An absent side means the edge cannot be taken: frames flowing along it
/// become TOP.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct BranchDecision<V> {
    tested: ValueNumber,
    taken: Option<V>,
    fall_through: Option<V>,
}

impl<V: FrameValue> BranchDecision<V> {
    /// Returns `None` when neither side carries a value.
    pub(crate) fn new(tested: ValueNumber, taken: Option<V>, fall_through: Option<V>) -> Option<Self> {
        if taken.is_none() && fall_through.is_none() {
            return None;
        }
        Some(Self {
            tested,
            taken,
            fall_through,
        })
    }

    pub(crate) fn tested(&self) -> ValueNumber {
        self.tested
    }

    pub(crate) fn taken(&self) -> Option<&V> {
        self.taken.as_ref()
    }

    pub(crate) fn fall_through(&self) -> Option<&V> {
        self.fall_through.as_ref()
    }

    /// Refine `frame`, the source block's result, before it flows along an edge.
    ///
    /// `before_branch` numbers the slots before the branch instruction and
    /// `target` numbers the successor's entry. Exception edges are left alone.
    pub(crate) fn apply(
        &self,
        kind: EdgeKind,
        before_branch: &ValueNumberFrame,
        target: &ValueNumberFrame,
        frame: &mut Frame<V>,
    ) {
        let value = match kind {
            EdgeKind::Branch => &self.taken,
            EdgeKind::FallThrough => &self.fall_through,
            EdgeKind::HandledException | EdgeKind::UnhandledException => return,
        };
        let Some(value) = value else {
            frame.set_top();
            return;
        };
        replace_values(frame, self.tested, before_branch, target, value);
    }
}

/// Assign `replacement` to every cell holding the tested value along one edge.
///
/// Each slot that held `tested` before the branch names a class in the target
/// numbering, and every target slot in that class is rewritten. A redundant
/// load of the tested value gets the replacement as its known value.
pub(crate) fn replace_values<V: FrameValue>(
    frame: &mut Frame<V>,
    tested: ValueNumber,
    before_branch: &ValueNumberFrame,
    target: &ValueNumberFrame,
    replacement: &V,
) {
    if !frame.is_valid() || !before_branch.is_valid() || !target.is_valid() {
        return;
    }
    if frame.num_slots() != target.num_slots() {
        return;
    }

    if let Some(load) = before_branch.load_for(tested) {
        if let Some(vn) = target.available_load(load) {
            frame.set_known_value(vn, replacement.clone());
        }
    }

    let prefix = frame.num_slots().min(before_branch.num_slots());
    for slot in 0..prefix {
        if before_branch.value(slot) != Some(tested) {
            continue;
        }
        let Some(corresponding) = target.value(slot) else {
            continue;
        };
        for (index, vn) in target.slots().iter().enumerate() {
            if *vn == corresponding {
                // Slot counts match, so the index is live.
                let _ = frame.set_value(index, replacement.clone());
            }
        }
    }
}
