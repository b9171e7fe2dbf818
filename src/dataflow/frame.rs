use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Result, bail};
use serde::Serialize;

use crate::vna::ValueNumber;

/// Lattice value stored in frame cells.
pub(crate) trait FrameValue: Clone + PartialEq + fmt::Debug {
    /// Bottom-of-information cell value; the identity of `join`.
    fn top() -> Self;

    /// Least upper bound of two values.
    fn join(&self, other: &Self) -> Self;
}

/// Whether a frame describes reachable state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Validity {
    Valid,
    /// Unreachable or no information yet.
    Top,
}

/// Abstract machine state: local slots followed by operand stack cells.
///
/// Cells past the current stack depth always hold `V::top()`, and a TOP frame
/// holds no values at all, so structural equality is frame equality.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Frame<V> {
    cells: Vec<V>,
    num_locals: usize,
    depth: usize,
    validity: Validity,
    known_values: BTreeMap<ValueNumber, V>,
}

impl<V: FrameValue> Frame<V> {
    /// Create a TOP frame sized for a method.
    pub(crate) fn new(num_locals: usize, max_stack: usize) -> Self {
        Self {
            cells: vec![V::top(); num_locals + max_stack],
            num_locals,
            depth: 0,
            validity: Validity::Top,
            known_values: BTreeMap::new(),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }

    pub(crate) fn validity(&self) -> Validity {
        self.validity
    }

    /// Make a TOP frame valid with every cell at `V::top()` and an empty stack.
    pub(crate) fn set_valid(&mut self) {
        self.clear();
        self.validity = Validity::Valid;
    }

    pub(crate) fn set_top(&mut self) {
        self.clear();
        self.validity = Validity::Top;
    }

    fn clear(&mut self) {
        self.cells.fill(V::top());
        self.depth = 0;
        self.known_values.clear();
    }

    pub(crate) fn num_locals(&self) -> usize {
        self.num_locals
    }

    pub(crate) fn max_stack(&self) -> usize {
        self.cells.len() - self.num_locals
    }

    pub(crate) fn stack_depth(&self) -> usize {
        self.depth
    }

    /// Number of live slots: locals plus the current stack.
    pub(crate) fn num_slots(&self) -> usize {
        self.num_locals + self.depth
    }

    /// Live slots, locals first.
    pub(crate) fn slots(&self) -> &[V] {
        &self.cells[..self.num_slots()]
    }

    pub(crate) fn locals(&self) -> &[V] {
        &self.cells[..self.num_locals]
    }

    /// Stack cells, bottom first.
    pub(crate) fn stack(&self) -> &[V] {
        &self.cells[self.num_locals..self.num_slots()]
    }

    pub(crate) fn value(&self, slot: usize) -> Result<&V> {
        if slot >= self.num_slots() {
            bail!("slot {slot} out of range ({} live slots)", self.num_slots());
        }
        Ok(&self.cells[slot])
    }

    pub(crate) fn set_value(&mut self, slot: usize, value: V) -> Result<()> {
        if slot >= self.num_slots() {
            bail!("slot {slot} out of range ({} live slots)", self.num_slots());
        }
        self.cells[slot] = value;
        Ok(())
    }

    pub(crate) fn local(&self, index: usize) -> Result<&V> {
        if index >= self.num_locals {
            bail!("local {index} out of range ({} locals)", self.num_locals);
        }
        Ok(&self.cells[index])
    }

    pub(crate) fn set_local(&mut self, index: usize, value: V) -> Result<()> {
        if index >= self.num_locals {
            bail!("local {index} out of range ({} locals)", self.num_locals);
        }
        self.cells[index] = value;
        Ok(())
    }

    pub(crate) fn push(&mut self, value: V) -> Result<()> {
        if self.num_slots() >= self.cells.len() {
            bail!("operand stack overflow (max {})", self.max_stack());
        }
        let slot = self.num_slots();
        self.cells[slot] = value;
        self.depth += 1;
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<V> {
        if self.depth == 0 {
            bail!("operand stack underflow");
        }
        self.depth -= 1;
        let slot = self.num_slots();
        Ok(std::mem::replace(&mut self.cells[slot], V::top()))
    }

    pub(crate) fn pop_n(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.pop()?;
        }
        Ok(())
    }

    /// Value `depth_from_top` cells below the top of the stack.
    pub(crate) fn stack_value(&self, depth_from_top: usize) -> Result<&V> {
        if depth_from_top >= self.depth {
            bail!(
                "stack value {depth_from_top} requested with depth {}",
                self.depth
            );
        }
        Ok(&self.cells[self.num_slots() - 1 - depth_from_top])
    }

    pub(crate) fn top_value(&self) -> Result<&V> {
        self.stack_value(0)
    }

    pub(crate) fn clear_stack(&mut self) {
        let start = self.num_locals;
        self.cells[start..].fill(V::top());
        self.depth = 0;
    }

    /// Replace the stack with a single value, as on exception-handler entry.
    pub(crate) fn reset_stack_to(&mut self, value: V) -> Result<()> {
        self.clear_stack();
        self.push(value)
    }

    pub(crate) fn known_value(&self, vn: ValueNumber) -> Option<&V> {
        self.known_values.get(&vn)
    }

    pub(crate) fn set_known_value(&mut self, vn: ValueNumber, value: V) {
        self.known_values.insert(vn, value);
    }

    pub(crate) fn known_values(&self) -> &BTreeMap<ValueNumber, V> {
        &self.known_values
    }

    pub(crate) fn known_values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.known_values.values_mut()
    }

    pub(crate) fn clear_known_values(&mut self) {
        self.known_values.clear();
    }

    /// Join `other` into this frame, returning whether this frame changed.
    ///
    /// TOP is the identity. Known values survive only when both frames have
    /// an entry for the congruence class.
    pub(crate) fn merge_with(&mut self, other: &Self) -> Result<bool> {
        if !other.is_valid() {
            return Ok(false);
        }
        if !self.is_valid() {
            *self = other.clone();
            return Ok(true);
        }
        if self.cells.len() != other.cells.len() || self.num_locals != other.num_locals {
            bail!("merging frames of different shapes");
        }
        if self.depth != other.depth {
            bail!(
                "merging frames with stack depths {} and {}",
                self.depth,
                other.depth
            );
        }

        let before = self.clone();
        let live = self.num_slots();
        for (cell, incoming) in self.cells[..live].iter_mut().zip(&other.cells[..live]) {
            *cell = cell.join(incoming);
        }
        self.known_values = self
            .known_values
            .iter()
            .filter_map(|(vn, value)| {
                other
                    .known_values
                    .get(vn)
                    .map(|incoming| (*vn, value.join(incoming)))
            })
            .collect();
        Ok(*self != before)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Chain lattice used to exercise frame mechanics.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
    pub(crate) struct Level(pub(crate) u8);

    impl FrameValue for Level {
        fn top() -> Self {
            Level(0)
        }

        fn join(&self, other: &Self) -> Self {
            Level(self.0.max(other.0))
        }
    }

    fn valid_frame(locals: &[u8], stack: &[u8]) -> Frame<Level> {
        let mut frame = Frame::new(locals.len(), 4);
        frame.set_valid();
        for (index, value) in locals.iter().enumerate() {
            frame.set_local(index, Level(*value)).expect("local");
        }
        for value in stack {
            frame.push(Level(*value)).expect("push");
        }
        frame
    }

    #[test]
    fn push_and_pop_track_depth() {
        let mut frame = valid_frame(&[1], &[]);
        frame.push(Level(2)).expect("push");
        frame.push(Level(3)).expect("push");

        assert_eq!(frame.num_slots(), 3);
        assert_eq!(*frame.stack_value(1).expect("below top"), Level(2));
        assert_eq!(frame.pop().expect("pop"), Level(3));
        assert_eq!(frame.stack(), &[Level(2)]);
    }

    #[test]
    fn stack_limits_are_errors() {
        let mut frame = valid_frame(&[], &[]);

        assert!(frame.pop().is_err());
        for value in 0..4 {
            frame.push(Level(value)).expect("push");
        }
        assert!(frame.push(Level(9)).is_err());
    }

    #[test]
    fn merge_into_top_copies_source() {
        let mut dest = Frame::new(1, 2);
        let source = valid_frame(&[3], &[1]);

        assert!(dest.merge_with(&source).expect("merge"));
        assert_eq!(dest, source);
    }

    #[test]
    fn merge_with_top_is_identity() {
        let mut dest = valid_frame(&[3], &[1]);
        let before = dest.clone();

        assert!(!dest.merge_with(&Frame::new(1, 4)).expect("merge"));
        assert_eq!(dest, before);
    }

    #[test]
    fn merge_joins_cells_and_intersects_known_values() {
        let mut dest = valid_frame(&[1, 5], &[]);
        dest.set_known_value(ValueNumber(1), Level(1));
        dest.set_known_value(ValueNumber(2), Level(2));
        let mut source = valid_frame(&[4, 2], &[]);
        source.set_known_value(ValueNumber(2), Level(7));

        assert!(dest.merge_with(&source).expect("merge"));

        assert_eq!(dest.locals(), &[Level(4), Level(5)]);
        assert_eq!(dest.known_value(ValueNumber(1)), None);
        assert_eq!(dest.known_value(ValueNumber(2)), Some(&Level(7)));
    }

    #[test]
    fn merge_rejects_stack_depth_mismatch() {
        let mut dest = valid_frame(&[1], &[1]);
        let source = valid_frame(&[1], &[]);

        assert!(dest.merge_with(&source).is_err());
    }

    #[test]
    fn reset_stack_leaves_single_value() {
        let mut frame = valid_frame(&[1], &[2, 3]);

        frame.reset_stack_to(Level(9)).expect("reset");

        assert_eq!(frame.stack(), &[Level(9)]);
        assert_eq!(frame.locals(), &[Level(1)]);
    }

    #[test]
    fn set_top_discards_contents() {
        let mut frame = valid_frame(&[1], &[2]);
        frame.set_known_value(ValueNumber(0), Level(1));

        frame.set_top();

        assert!(!frame.is_valid());
        assert_eq!(frame, Frame::new(1, 4));
    }
}
