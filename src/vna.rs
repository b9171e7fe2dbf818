use std::cell::RefCell;
use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::cfg::MethodGraph;
use crate::dataflow::driver::{Dataflow, DataflowFact, DataflowSemantics};
use crate::ir::{BlockId, Edge, FieldRef, Instruction, InstructionKind, Location, Method};

/// Congruence class identifier; equal numbers denote provably equal values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub(crate) struct ValueNumber(pub(crate) u32);

/// Heap read whose result is still available without re-loading.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum AvailableLoad {
    Field {
        /// Congruence class of the object; `None` for static fields.
        reference: Option<ValueNumber>,
        field: FieldRef,
    },
    Element {
        array: ValueNumber,
        index: ValueNumber,
    },
}

/// Congruence classes of every live slot at one program point.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ValueNumberFrame {
    valid: bool,
    num_locals: usize,
    slots: Vec<ValueNumber>,
    available_loads: BTreeMap<AvailableLoad, ValueNumber>,
}

impl ValueNumberFrame {
    fn top() -> Self {
        Self {
            valid: false,
            num_locals: 0,
            slots: Vec::new(),
            available_loads: BTreeMap::new(),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn num_locals(&self) -> usize {
        self.num_locals
    }

    pub(crate) fn value(&self, slot: usize) -> Option<ValueNumber> {
        self.slots.get(slot).copied()
    }

    pub(crate) fn slots(&self) -> &[ValueNumber] {
        &self.slots
    }

    /// Value `depth_from_top` cells below the top of the stack.
    pub(crate) fn stack_value(&self, depth_from_top: usize) -> Option<ValueNumber> {
        let depth = self.slots.len() - self.num_locals;
        if depth_from_top >= depth {
            return None;
        }
        self.slots.get(self.slots.len() - 1 - depth_from_top).copied()
    }

    pub(crate) fn top_value(&self) -> Option<ValueNumber> {
        self.stack_value(0)
    }

    pub(crate) fn available_load(&self, load: &AvailableLoad) -> Option<ValueNumber> {
        self.available_loads.get(load).copied()
    }

    /// Load whose available value is `vn`, if any.
    pub(crate) fn load_for(&self, vn: ValueNumber) -> Option<&AvailableLoad> {
        self.available_loads
            .iter()
            .find_map(|(load, value)| (*value == vn).then_some(load))
    }

    pub(crate) fn available_loads(&self) -> impl Iterator<Item = (&AvailableLoad, ValueNumber)> {
        self.available_loads.iter().map(|(load, vn)| (load, *vn))
    }

    fn push(&mut self, vn: ValueNumber) {
        self.slots.push(vn);
    }

    fn pop(&mut self) -> Result<ValueNumber> {
        if self.slots.len() <= self.num_locals {
            bail!("value-number stack underflow");
        }
        self.slots.pop().context("value-number stack underflow")
    }

    #[cfg(test)]
    pub(crate) fn from_slots(num_locals: usize, slots: &[u32]) -> Self {
        Self {
            valid: true,
            num_locals,
            slots: slots.iter().map(|vn| ValueNumber(*vn)).collect(),
            available_loads: BTreeMap::new(),
        }
    }

    fn kill_field(&mut self, field: &FieldRef) {
        self.available_loads.retain(|load, _| match load {
            AvailableLoad::Field { field: loaded, .. } => loaded != field,
            AvailableLoad::Element { .. } => true,
        });
    }

    /// Any array may alias the stored one.
    fn kill_elements(&mut self) {
        self.available_loads
            .retain(|load, _| matches!(load, AvailableLoad::Field { .. }));
    }
}

impl DataflowFact for ValueNumberFrame {
    fn is_top(&self) -> bool {
        !self.valid
    }

    fn set_top(&mut self) {
        *self = Self::top();
    }
}

/// Where a congruence class was first created.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum ValueOrigin {
    Entry(usize),
    Produced(Location, usize),
    Merge(BlockId, usize),
    Handler(BlockId),
}

/// Per-location congruence classes for one method.
pub(crate) trait ValueNumberOracle {
    fn fact_at_location(&self, location: Location) -> Option<&ValueNumberFrame>;
    fn fact_after_location(&self, location: Location) -> Option<&ValueNumberFrame>;
    fn start_fact(&self, block: BlockId) -> Option<&ValueNumberFrame>;
}

/// Forward value numbering with copy propagation and redundant-load tracking.
struct ValueNumberSemantics {
    num_locals: usize,
    fact_height: usize,
    numbers: RefCell<BTreeMap<ValueOrigin, ValueNumber>>,
}

impl ValueNumberSemantics {
    fn number(&self, origin: ValueOrigin) -> ValueNumber {
        let mut numbers = self.numbers.borrow_mut();
        let next = ValueNumber(numbers.len() as u32);
        *numbers.entry(origin).or_insert(next)
    }

    fn load(&self, location: Location, load: AvailableLoad, frame: &mut ValueNumberFrame) {
        let vn = match frame.available_load(&load) {
            Some(vn) => vn,
            None => {
                let vn = self.number(ValueOrigin::Produced(location, 0));
                frame.available_loads.insert(load, vn);
                vn
            }
        };
        frame.push(vn);
    }
}

impl DataflowSemantics for ValueNumberSemantics {
    type Fact = ValueNumberFrame;
    type Decision = ();

    fn create_fact(&self) -> Self::Fact {
        ValueNumberFrame::top()
    }

    fn init_entry_fact(&self, fact: &mut Self::Fact) {
        fact.valid = true;
        fact.num_locals = self.num_locals;
        fact.slots = (0..self.num_locals)
            .map(|slot| self.number(ValueOrigin::Entry(slot)))
            .collect();
        fact.available_loads.clear();
    }

    fn fact_height(&self) -> usize {
        self.fact_height
    }

    fn transfer_instruction(
        &self,
        location: Location,
        instruction: &Instruction,
        fact: &mut Self::Fact,
    ) -> Result<()> {
        match &instruction.kind {
            InstructionKind::Nop
            | InstructionKind::Goto
            | InstructionKind::Return
            | InstructionKind::CheckCast => {}
            InstructionKind::Load { slot } => {
                let vn = fact
                    .value(*slot)
                    .filter(|_| *slot < fact.num_locals)
                    .with_context(|| format!("load of unknown local {slot}"))?;
                fact.push(vn);
            }
            InstructionKind::Store { slot } => {
                if *slot >= fact.num_locals {
                    bail!("store to unknown local {slot}");
                }
                let vn = fact.pop()?;
                fact.slots[*slot] = vn;
            }
            InstructionKind::Pop => {
                fact.pop()?;
            }
            InstructionKind::Dup => {
                let vn = fact.pop()?;
                fact.push(vn);
                fact.push(vn);
            }
            InstructionKind::DupX1 => {
                let first = fact.pop()?;
                let second = fact.pop()?;
                fact.push(first);
                fact.push(second);
                fact.push(first);
            }
            InstructionKind::Swap => {
                let first = fact.pop()?;
                let second = fact.pop()?;
                fact.push(first);
                fact.push(second);
            }
            InstructionKind::GetField(field) => {
                let reference = fact.pop()?;
                let load = AvailableLoad::Field {
                    reference: Some(reference),
                    field: field.clone(),
                };
                self.load(location, load, fact);
            }
            InstructionKind::GetStatic(field) => {
                let load = AvailableLoad::Field {
                    reference: None,
                    field: field.clone(),
                };
                self.load(location, load, fact);
            }
            InstructionKind::ArrayLoad => {
                let index = fact.pop()?;
                let array = fact.pop()?;
                self.load(location, AvailableLoad::Element { array, index }, fact);
            }
            InstructionKind::ArrayStore => {
                let value = fact.pop()?;
                let index = fact.pop()?;
                let array = fact.pop()?;
                fact.kill_elements();
                fact.available_loads
                    .insert(AvailableLoad::Element { array, index }, value);
            }
            InstructionKind::PutField(field) => {
                let value = fact.pop()?;
                let reference = fact.pop()?;
                fact.kill_field(field);
                fact.available_loads.insert(
                    AvailableLoad::Field {
                        reference: Some(reference),
                        field: field.clone(),
                    },
                    value,
                );
            }
            InstructionKind::PutStatic(field) => {
                let value = fact.pop()?;
                fact.kill_field(field);
                fact.available_loads.insert(
                    AvailableLoad::Field {
                        reference: None,
                        field: field.clone(),
                    },
                    value,
                );
            }
            InstructionKind::Invoke(_) => {
                let effect = instruction.kind.stack_effect()?;
                for _ in 0..effect.pops {
                    fact.pop()?;
                }
                fact.available_loads.clear();
                for output in 0..effect.pushes {
                    fact.push(self.number(ValueOrigin::Produced(location, output)));
                }
            }
            other => {
                let effect = other.stack_effect()?;
                for _ in 0..effect.pops {
                    fact.pop()?;
                }
                for output in 0..effect.pushes {
                    fact.push(self.number(ValueOrigin::Produced(location, output)));
                }
            }
        }
        Ok(())
    }

    fn enter_exception_edge(&self, edge: &Edge, fact: &mut Self::Fact) -> Result<()> {
        fact.slots.truncate(fact.num_locals);
        fact.push(self.number(ValueOrigin::Handler(edge.to)));
        Ok(())
    }

    fn join_into(&self, edge: &Edge, source: &Self::Fact, dest: &mut Self::Fact) -> Result<()> {
        if source.is_top() {
            return Ok(());
        }
        if dest.is_top() {
            *dest = source.clone();
            return Ok(());
        }
        if dest.slots.len() != source.slots.len() {
            bail!(
                "value-number frames with {} and {} slots meet at {}",
                dest.slots.len(),
                source.slots.len(),
                edge.to
            );
        }
        for (slot, (mine, theirs)) in dest.slots.iter_mut().zip(&source.slots).enumerate() {
            if mine != theirs {
                *mine = self.number(ValueOrigin::Merge(edge.to, slot));
            }
        }
        dest.available_loads
            .retain(|load, vn| source.available_loads.get(load) == Some(vn));
        Ok(())
    }
}

/// Value-number frames before and after every instruction of a method.
pub(crate) struct ValueNumberTable {
    facts: Vec<Vec<ValueNumberFrame>>,
}

impl ValueNumberTable {
    pub(crate) fn compute(graph: &MethodGraph<'_>, method: &Method) -> Result<Self> {
        let instruction_count: usize = graph
            .cfg()
            .blocks
            .iter()
            .map(|block| block.instructions.len())
            .sum();
        let semantics = ValueNumberSemantics {
            num_locals: method.max_locals,
            fact_height: 2 * (method.max_locals + method.max_stack) + instruction_count + 2,
            numbers: RefCell::new(BTreeMap::new()),
        };
        let dataflow = Dataflow::execute(graph, semantics).context("value numbering")?;
        let facts = (0..graph.block_count())
            .map(|index| dataflow.block_facts(BlockId(index)))
            .collect();
        Ok(Self { facts })
    }
}

impl ValueNumberOracle for ValueNumberTable {
    fn fact_at_location(&self, location: Location) -> Option<&ValueNumberFrame> {
        self.facts.get(location.block.index())?.get(location.index)
    }

    fn fact_after_location(&self, location: Location) -> Option<&ValueNumberFrame> {
        self.facts.get(location.block.index())?.get(location.index + 1)
    }

    fn start_fact(&self, block: BlockId) -> Option<&ValueNumberFrame> {
        self.facts.get(block.index())?.first()
    }
}
