use std::collections::{BTreeSet, VecDeque};

use anyhow::Result;
use tracing::debug;

use crate::annotations::{NonNullParameters, NullnessAnnotations};
use crate::callgraph::{CallTargetResolver, MethodId};
use crate::cfg::MethodGraph;
use crate::config::AnalysisConfig;
use crate::dataflow::frame::FrameValue;
use crate::descriptor::{ReturnKind, is_reference_field, method_param_count, method_return_kind};
use crate::ir::{CallKind, CallSite, FieldRef, Instruction, InstructionKind, Location, Nullness};
use crate::nullness::assertions::AssertionRecognizer;
use crate::nullness::checked_calls::CheckedCallTable;
use crate::nullness::value::{IsNullValue, IsNullValueFrame};
use crate::summary::{MethodSummary, SummaryStore};
use crate::vna::{AvailableLoad, ValueNumber, ValueNumberFrame, ValueNumberOracle};

/// Side results of modeling one instruction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct ModelOutcome {
    /// Slot of a `DefinitelyNull` value the instruction just produced.
    pub(crate) new_null_slot: Option<usize>,
}

/// Program-wide collaborators consulted at call sites and field accesses.
pub(crate) struct Interprocedural<'a> {
    pub(crate) summaries: &'a SummaryStore,
    pub(crate) resolver: &'a dyn CallTargetResolver,
    pub(crate) annotations: &'a dyn NullnessAnnotations,
    pub(crate) non_null_parameters: &'a dyn NonNullParameters,
}

/// Nullness transfer function for single instructions of one method.
pub(crate) struct NullnessModel<'a> {
    pub(crate) config: &'a AnalysisConfig,
    pub(crate) assertions: &'a AssertionRecognizer,
    pub(crate) graph: &'a MethodGraph<'a>,
    pub(crate) value_numbers: &'a dyn ValueNumberOracle,
    pub(crate) checked_calls: Option<&'a CheckedCallTable>,
    pub(crate) interprocedural: &'a Interprocedural<'a>,
}

impl NullnessModel<'_> {
    /// Apply `instruction` to `frame`. Invalid frames are left untouched.
    pub(crate) fn model(
        &self,
        location: Location,
        instruction: &Instruction,
        frame: &mut IsNullValueFrame,
    ) -> Result<ModelOutcome> {
        let mut outcome = ModelOutcome::default();
        if !frame.is_valid() {
            return Ok(outcome);
        }
        let dereferenced = self.dereferenced_value(location, &instruction.kind, frame);

        self.model_instruction(location, &instruction.kind, frame, &mut outcome)?;
        if !frame.is_valid() {
            return Ok(outcome);
        }

        if let Some(vn) = dereferenced {
            self.guard_dereferenced(location, vn, frame)?;
        }
        if let InstructionKind::Invoke(call) = &instruction.kind {
            if self.config.suppress_assertion_nulls && self.assertions.is_assertion(call) {
                suppress_null_values(frame)?;
            }
        }
        Ok(outcome)
    }

    fn model_instruction(
        &self,
        location: Location,
        kind: &InstructionKind,
        frame: &mut IsNullValueFrame,
        outcome: &mut ModelOutcome,
    ) -> Result<()> {
        match kind {
            InstructionKind::Nop
            | InstructionKind::Goto
            | InstructionKind::Return
            | InstructionKind::CheckCast => {}
            InstructionKind::ConstNull => {
                self.produce(location, frame, IsNullValue::DefinitelyNull, outcome)?;
            }
            InstructionKind::ConstReference | InstructionKind::New { .. } => {
                self.produce(location, frame, IsNullValue::NonNullProven, outcome)?;
            }
            InstructionKind::NewArray => {
                frame.pop()?;
                self.produce(location, frame, IsNullValue::NonNullProven, outcome)?;
            }
            InstructionKind::MultiNewArray { dimensions } => {
                frame.pop_n(*dimensions)?;
                self.produce(location, frame, IsNullValue::NonNullProven, outcome)?;
            }
            InstructionKind::Load { slot } => {
                let value = *frame.local(*slot)?;
                frame.push(value)?;
            }
            InstructionKind::Store { slot } => {
                let value = frame.pop()?;
                frame.set_local(*slot, value)?;
            }
            InstructionKind::Pop => {
                frame.pop()?;
            }
            InstructionKind::Dup => {
                let value = *frame.top_value()?;
                frame.push(value)?;
            }
            InstructionKind::DupX1 => {
                let first = frame.pop()?;
                let second = frame.pop()?;
                frame.push(first)?;
                frame.push(second)?;
                frame.push(first)?;
            }
            InstructionKind::Swap => {
                let first = frame.pop()?;
                let second = frame.pop()?;
                frame.push(first)?;
                frame.push(second)?;
            }
            InstructionKind::GetField(field) => {
                self.model_field_load(location, field, 1, frame, outcome)?;
            }
            InstructionKind::GetStatic(field) => {
                self.model_field_load(location, field, 0, frame, outcome)?;
            }
            InstructionKind::PutField(field) => {
                self.model_field_store(location, field, Some(1), frame)?;
            }
            InstructionKind::PutStatic(field) => {
                self.model_field_store(location, field, None, frame)?;
            }
            InstructionKind::Invoke(call) => {
                self.model_invoke(location, call, frame, outcome)?;
            }
            InstructionKind::ArrayLoad => {
                if !self.load_known_value(location, 2, frame, outcome)? {
                    model_normal(kind, frame)?;
                }
            }
            InstructionKind::ArrayStore => {
                self.model_array_store(location, frame)?;
            }
            InstructionKind::ConstPrimitive
            | InstructionKind::ArrayLength
            | InstructionKind::InstanceOf
            | InstructionKind::Arithmetic { .. }
            | InstructionKind::IfNull
            | InstructionKind::IfNonNull
            | InstructionKind::IfRefEq
            | InstructionKind::IfRefNe
            | InstructionKind::IfEq
            | InstructionKind::IfNe
            | InstructionKind::IfCompare { .. }
            | InstructionKind::Switch
            | InstructionKind::ReturnValue
            | InstructionKind::Throw
            | InstructionKind::MonitorEnter
            | InstructionKind::MonitorExit => model_normal(kind, frame)?,
        }
        Ok(())
    }

    /// Push a freshly produced value and remember it for its congruence class.
    fn produce(
        &self,
        location: Location,
        frame: &mut IsNullValueFrame,
        value: IsNullValue,
        outcome: &mut ModelOutcome,
    ) -> Result<()> {
        frame.push(value)?;
        if value.is_definitely_null() {
            outcome.new_null_slot = Some(frame.num_slots() - 1);
        }
        if self.config.track_value_numbers {
            if let Some(vn) = self.after(location).and_then(ValueNumberFrame::top_value) {
                frame.set_known_value(vn, value);
            }
        }
        Ok(())
    }

    fn before(&self, location: Location) -> Option<&ValueNumberFrame> {
        self.value_numbers
            .fact_at_location(location)
            .filter(|frame| frame.is_valid())
    }

    fn after(&self, location: Location) -> Option<&ValueNumberFrame> {
        self.value_numbers
            .fact_after_location(location)
            .filter(|frame| frame.is_valid())
    }

    /// Resolve a load whose result class already has a known value.
    fn load_known_value(
        &self,
        location: Location,
        pops: usize,
        frame: &mut IsNullValueFrame,
        outcome: &mut ModelOutcome,
    ) -> Result<bool> {
        if !self.config.track_value_numbers {
            return Ok(false);
        }
        let Some(vn) = self.after(location).and_then(ValueNumberFrame::top_value) else {
            return Ok(false);
        };
        let Some(known) = frame.known_value(vn).copied() else {
            return Ok(false);
        };
        frame.pop_n(pops)?;
        self.produce(location, frame, known, outcome)?;
        Ok(true)
    }

    fn model_field_load(
        &self,
        location: Location,
        field: &FieldRef,
        pops: usize,
        frame: &mut IsNullValueFrame,
        outcome: &mut ModelOutcome,
    ) -> Result<()> {
        if self.load_known_value(location, pops, frame, outcome)? {
            return Ok(());
        }
        frame.pop_n(pops)?;
        if !is_reference_field(&field.descriptor) {
            return frame.push(IsNullValue::NonNullSilent);
        }
        if pops == 0 && field.name.starts_with("class$") {
            return self.produce(location, frame, IsNullValue::NonNullProven, outcome);
        }
        match self.interprocedural.annotations.field_nullness(field) {
            Nullness::NonNull => self.produce(location, frame, IsNullValue::NonNullProven, outcome),
            Nullness::CheckForNull => {
                self.produce(location, frame, IsNullValue::NullOnSimplePath, outcome)
            }
            Nullness::Nullable | Nullness::Unknown => frame.push(IsNullValue::NonNullSilent),
        }
    }

    /// Remember the stored value for the load that the store made available.
    fn model_field_store(
        &self,
        location: Location,
        field: &FieldRef,
        reference_depth: Option<usize>,
        frame: &mut IsNullValueFrame,
    ) -> Result<()> {
        let stored = *frame.top_value()?;
        frame.pop_n(if reference_depth.is_some() { 2 } else { 1 })?;
        if !self.config.track_value_numbers {
            return Ok(());
        }
        let reference = match reference_depth {
            Some(depth) => {
                let Some(reference) = self
                    .before(location)
                    .and_then(|numbers| numbers.stack_value(depth))
                else {
                    return Ok(());
                };
                Some(reference)
            }
            None => None,
        };
        let load = AvailableLoad::Field {
            reference,
            field: field.clone(),
        };
        if let Some(vn) = self.after(location).and_then(|numbers| numbers.available_load(&load)) {
            frame.set_known_value(vn, stored);
        }
        Ok(())
    }

    /// Remember the stored value for the element the store made available.
    fn model_array_store(&self, location: Location, frame: &mut IsNullValueFrame) -> Result<()> {
        let stored = *frame.top_value()?;
        frame.pop_n(3)?;
        if !self.config.track_value_numbers {
            return Ok(());
        }
        let Some(numbers) = self.before(location) else {
            return Ok(());
        };
        let (Some(array), Some(index)) = (numbers.stack_value(2), numbers.stack_value(1)) else {
            return Ok(());
        };
        let load = AvailableLoad::Element { array, index };
        if let Some(vn) = self.after(location).and_then(|numbers| numbers.available_load(&load)) {
            frame.set_known_value(vn, stored);
        }
        Ok(())
    }

    fn model_invoke(
        &self,
        location: Location,
        call: &CallSite,
        frame: &mut IsNullValueFrame,
        outcome: &mut ModelOutcome,
    ) -> Result<()> {
        let targets = self.interprocedural.resolver.resolve(call);
        if self.config.track_value_numbers
            && !self.guard_non_null_arguments(location, call, &targets, frame)?
        {
            return Ok(());
        }
        if call.kind == CallKind::Static {
            self.apply_thrower_summary(location, call, &targets, frame)?;
        }

        let consumed = call.consumed_values()?;
        match method_return_kind(&call.descriptor)? {
            ReturnKind::Reference => {
                let value = self.return_value(location, call, &targets);
                frame.pop_n(consumed)?;
                self.produce(location, frame, value, outcome)?;
            }
            ReturnKind::Primitive => {
                frame.pop_n(consumed)?;
                frame.push(IsNullValue::NonNullSilent)?;
            }
            ReturnKind::Void => frame.pop_n(consumed)?,
        }
        Ok(())
    }

    /// Tighten arguments every callee requires to be non-null.
    ///
    /// Returns `false` when a required argument is definitely null: the call
    /// cannot complete, so the frame becomes TOP.
    fn guard_non_null_arguments(
        &self,
        location: Location,
        call: &CallSite,
        targets: &[MethodId],
        frame: &mut IsNullValueFrame,
    ) -> Result<bool> {
        let required = self
            .interprocedural
            .non_null_parameters
            .non_null_parameters(call, targets);
        if required.is_empty() {
            return Ok(true);
        }
        let Some(before) = self.before(location) else {
            return Ok(true);
        };
        let params = method_param_count(&call.descriptor)?;

        for argument in required.into_iter().filter(|argument| *argument < params) {
            let Some(vn) = before.stack_value(params - 1 - argument) else {
                continue;
            };
            if let Some(known) = frame.known_value(vn).copied() {
                if known.is_definitely_null() {
                    return Ok(self.infeasible_call(location, call, frame));
                }
                if !known.is_definitely_not_null() {
                    frame.set_known_value(vn, IsNullValue::NonNullGuarded);
                }
            }
            let live = frame.num_slots().min(before.num_slots());
            for slot in 0..live {
                if before.value(slot) != Some(vn) {
                    continue;
                }
                let value = *frame.value(slot)?;
                if value.is_definitely_null() {
                    return Ok(self.infeasible_call(location, call, frame));
                }
                if !value.is_top() && !value.is_definitely_not_null() {
                    frame.set_value(slot, IsNullValue::NonNullGuarded)?;
                }
            }
        }
        Ok(true)
    }

    fn infeasible_call(
        &self,
        location: Location,
        call: &CallSite,
        frame: &mut IsNullValueFrame,
    ) -> bool {
        debug!(
            "nullness: block={} index={} callee={}.{} event=null_argument_to_non_null_parameter",
            location.block, location.index, call.owner, call.name
        );
        frame.set_top();
        false
    }

    fn apply_thrower_summary(
        &self,
        location: Location,
        call: &CallSite,
        targets: &[MethodId],
        frame: &mut IsNullValueFrame,
    ) -> Result<()> {
        let callee = targets
            .first()
            .cloned()
            .unwrap_or_else(|| MethodId::declared_by(call));
        match self.interprocedural.summaries.get(&callee) {
            MethodSummary::None => {}
            MethodSummary::AlwaysThrows => {
                if call.consumed_values()? == 0 {
                    self.guard_before_thrower(location, frame)?;
                }
            }
            MethodSummary::Conditional(parameters) => {
                self.guard_checked_arguments(location, call, parameters, frame)?;
            }
        }
        Ok(())
    }

    /// `if (v != null) {...} else { fail(); }`: `v` reaching `fail()` would have thrown.
    fn guard_before_thrower(&self, location: Location, frame: &mut IsNullValueFrame) -> Result<()> {
        let mut visited = vec![false; self.graph.block_count()];
        let mut queue = VecDeque::from([location.block]);
        visited[location.block.index()] = true;
        while let Some(block_id) = queue.pop_front() {
            let block = self.graph.block(block_id);
            if let (Some(InstructionKind::IfNonNull), Some(InstructionKind::Load { slot })) =
                (block.last(), block.penultimate())
            {
                debug!(
                    "nullness: block={} guard={} local={} event=thrower_guard",
                    location.block, block_id, slot
                );
                return frame.set_local(*slot, IsNullValue::NonNullGuarded);
            }
            for edge in self.graph.incoming(block_id) {
                if !visited[edge.from.index()] {
                    visited[edge.from.index()] = true;
                    queue.push_back(edge.from);
                }
            }
        }
        Ok(())
    }

    /// Guard locals passed for parameters the callee checks by throwing.
    fn guard_checked_arguments(
        &self,
        location: Location,
        call: &CallSite,
        parameters: &BTreeSet<usize>,
        frame: &mut IsNullValueFrame,
    ) -> Result<()> {
        let consumed = call.consumed_values()?;
        let Some(slots) = self.argument_loads(location, consumed) else {
            return Ok(());
        };
        for (distance, slot) in slots.into_iter().enumerate() {
            let argument = consumed - 1 - distance;
            if parameters.contains(&argument) {
                frame.set_local(slot, IsNullValue::NonNullGuarded)?;
            }
        }
        Ok(())
    }

    /// Local slots loaded by the `count` instructions preceding `location`,
    /// nearest first, crossing unique fall-through predecessors.
    fn argument_loads(&self, location: Location, count: usize) -> Option<Vec<usize>> {
        let mut slots = Vec::with_capacity(count);
        let mut block = location.block;
        let mut index = location.index;
        let mut hops = 0;
        while slots.len() < count {
            if index == 0 {
                hops += 1;
                if hops > self.graph.block_count() {
                    return None;
                }
                block = self.graph.fall_through_predecessor(block)?;
                index = self.graph.block(block).instructions.len();
                continue;
            }
            index -= 1;
            match &self.graph.block(block).instructions[index].kind {
                InstructionKind::Load { slot } => slots.push(*slot),
                _ => return None,
            }
        }
        Some(slots)
    }

    fn return_value(&self, location: Location, call: &CallSite, targets: &[MethodId]) -> IsNullValue {
        if !self.config.model_return_values {
            return IsNullValue::NonNullSilent;
        }
        if self
            .checked_calls
            .is_some_and(|checked| checked.contains(location.block, &call.name))
        {
            return IsNullValue::NonNullSilent;
        }
        let declared = [MethodId::declared_by(call)];
        let targets = if targets.is_empty() {
            &declared[..]
        } else {
            targets
        };
        targets
            .iter()
            .map(|target| {
                match self.interprocedural.annotations.return_nullness(target) {
                    Nullness::CheckForNull => IsNullValue::NullOnSimplePath,
                    Nullness::NonNull => IsNullValue::NonNullProven,
                    Nullness::Nullable | Nullness::Unknown => IsNullValue::NonNullSilent,
                }
            })
            .reduce(|left, right| left.join(&right))
            .unwrap_or(IsNullValue::NonNullSilent)
    }

    /// Congruence class dereferenced by `kind`, when its value is undecided.
    fn dereferenced_value(
        &self,
        location: Location,
        kind: &InstructionKind,
        frame: &IsNullValueFrame,
    ) -> Option<ValueNumber> {
        if !self.config.model_dereferences || !self.config.track_value_numbers {
            return None;
        }
        let depth = match kind {
            InstructionKind::GetField(_)
            | InstructionKind::ArrayLength
            | InstructionKind::MonitorEnter
            | InstructionKind::MonitorExit
            | InstructionKind::Throw => 0,
            InstructionKind::PutField(_) | InstructionKind::ArrayLoad => 1,
            InstructionKind::ArrayStore => 2,
            InstructionKind::Invoke(call) if call.kind != CallKind::Static => {
                method_param_count(&call.descriptor).ok()?
            }
            _ => return None,
        };
        let value = *frame.stack_value(depth).ok()?;
        if value.is_top() || value.is_definitely_null() || value.is_definitely_not_null() {
            return None;
        }
        self.before(location)?.stack_value(depth)
    }

    fn guard_dereferenced(
        &self,
        location: Location,
        vn: ValueNumber,
        frame: &mut IsNullValueFrame,
    ) -> Result<()> {
        let Some(after) = self.after(location) else {
            return Ok(());
        };
        if let Some(known) = frame.known_value(vn).copied() {
            if !known.is_definitely_null() && !known.is_definitely_not_null() {
                frame.set_known_value(vn, IsNullValue::NonNullGuarded);
            }
        }
        let live = frame.num_slots().min(after.num_slots());
        for slot in 0..live {
            if after.value(slot) != Some(vn) {
                continue;
            }
            let value = *frame.value(slot)?;
            if !value.is_top() && !value.is_definitely_null() && !value.is_definitely_not_null() {
                frame.set_value(slot, IsNullValue::NonNullGuarded)?;
            }
        }
        Ok(())
    }
}

/// Pop the instruction's operands and push non-reporting results.
fn model_normal(kind: &InstructionKind, frame: &mut IsNullValueFrame) -> Result<()> {
    let effect = kind.stack_effect()?;
    frame.pop_n(effect.pops)?;
    for _ in 0..effect.pushes {
        frame.push(IsNullValue::NonNullSilent)?;
    }
    Ok(())
}

/// Values an assertion let through are not null anymore.
fn suppress_null_values(frame: &mut IsNullValueFrame) -> Result<()> {
    for slot in 0..frame.num_slots() {
        let value = *frame.value(slot)?;
        if value.is_definitely_null() || value.is_null_on_some_path() {
            frame.set_value(slot, IsNullValue::NonNullSilent)?;
        }
    }
    for value in frame.known_values_mut() {
        if value.is_definitely_null() || value.is_null_on_some_path() {
            *value = IsNullValue::NonNullSilent;
        }
    }
    Ok(())
}
