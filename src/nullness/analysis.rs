use anyhow::{Context, Result};

use crate::callgraph::MethodId;
use crate::cfg::MethodGraph;
use crate::config::AnalysisConfig;
use crate::dataflow::decision::BranchDecision;
use crate::dataflow::driver::{Dataflow, DataflowSemantics};
use crate::dataflow::frame::Frame;
use crate::descriptor::{parameter_slots, reference_parameters};
use crate::ir::{
    BasicBlock, BlockId, Class, Edge, EdgeKind, Instruction, InstructionKind, Location, Method,
    Nullness,
};
use crate::nullness::assertions::AssertionRecognizer;
use crate::nullness::checked_calls::CheckedCallTable;
use crate::nullness::modeling::{Interprocedural, NullnessModel};
use crate::nullness::value::{IsNullValue, IsNullValueFrame, LATTICE_HEIGHT};
use crate::vna::{ValueNumberOracle, ValueNumberTable};

/// Session-wide inputs shared by every nullness analysis.
pub(crate) struct NullnessContext<'a> {
    pub(crate) config: &'a AnalysisConfig,
    pub(crate) assertions: &'a AssertionRecognizer,
    pub(crate) interprocedural: Interprocedural<'a>,
}

/// Analyze one method body and hand the converged dataflow to `inspect`.
pub(crate) fn analyze_method<R>(
    context: &NullnessContext<'_>,
    class: &Class,
    method: &Method,
    inspect: impl FnOnce(&NullnessDataflow<'_>) -> R,
) -> Result<R> {
    let cfg = method.cfg.as_ref().context("method has no body")?;
    let graph = MethodGraph::new(cfg)?;
    let value_numbers = ValueNumberTable::compute(&graph, method)?;
    let checked_calls = if context.config.track_checked_calls {
        Some(CheckedCallTable::compute(&graph)?)
    } else {
        None
    };
    let model = NullnessModel {
        config: context.config,
        assertions: context.assertions,
        graph: &graph,
        value_numbers: &value_numbers,
        checked_calls: checked_calls.as_ref(),
        interprocedural: &context.interprocedural,
    };
    let id = MethodId::new(&class.name, &method.name, &method.descriptor);
    let analysis = NullnessAnalysis::new(&id, method, model)?;
    let dataflow = NullnessDataflow::execute(&graph, analysis)?;
    Ok(inspect(&dataflow))
}

/// Nullness client of the fixpoint driver.
pub(crate) struct NullnessAnalysis<'a> {
    model: NullnessModel<'a>,
    entry: IsNullValueFrame,
    fact_height: usize,
}

impl<'a> NullnessAnalysis<'a> {
    pub(crate) fn new(id: &MethodId, method: &Method, model: NullnessModel<'a>) -> Result<Self> {
        let entry = entry_frame(id, method, &model)
            .with_context(|| format!("entry frame of {id}"))?;
        let instruction_count: usize = model
            .graph
            .cfg()
            .blocks
            .iter()
            .map(|block| block.instructions.len())
            .sum();
        let cells = method.max_locals + method.max_stack;
        Ok(Self {
            model,
            entry,
            fact_height: (cells + instruction_count) * (LATTICE_HEIGHT + 1) + 2,
        })
    }

    fn value_numbers(&self) -> &dyn ValueNumberOracle {
        self.model.value_numbers
    }
}

/// `this` is proven non-null; parameters follow their annotations.
fn entry_frame(id: &MethodId, method: &Method, model: &NullnessModel<'_>) -> Result<IsNullValueFrame> {
    let mut frame = Frame::new(method.max_locals, method.max_stack);
    frame.set_valid();
    if !method.access.is_static {
        frame.set_local(0, IsNullValue::NonNullProven)?;
    }
    let slots = parameter_slots(&method.descriptor, method.access.is_static)?;
    let references = reference_parameters(&method.descriptor)?;
    for (index, (slot, is_reference)) in slots.into_iter().zip(references).enumerate() {
        let value = if is_reference {
            match model
                .interprocedural
                .annotations
                .parameter_nullness(id, index)
            {
                Nullness::NonNull => IsNullValue::NonNullProven,
                Nullness::CheckForNull => IsNullValue::NullOnSimplePath,
                Nullness::Nullable | Nullness::Unknown => IsNullValue::NonNullSilent,
            }
        } else {
            IsNullValue::NonNullSilent
        };
        frame.set_local(slot, value)?;
    }
    Ok(frame)
}

/// Values on the edges where a tested value is null and non-null.
fn null_test_outcomes(value: IsNullValue) -> (Option<IsNullValue>, Option<IsNullValue>) {
    if value.is_definitely_null() {
        (Some(IsNullValue::DefinitelyNull), None)
    } else if value.is_definitely_not_null() {
        (None, Some(value))
    } else {
        (Some(IsNullValue::DefinitelyNull), Some(IsNullValue::NonNullProven))
    }
}

/// Value on the edge where a tested value is known to be non-null.
fn non_null_outcome(value: IsNullValue) -> Option<IsNullValue> {
    if value.is_definitely_null() {
        None
    } else if value.is_definitely_not_null() {
        Some(value)
    } else {
        Some(IsNullValue::NonNullProven)
    }
}

#[derive(Clone, Copy)]
enum Resolved {
    Null,
    NonNull,
}

fn resolve(value: IsNullValue) -> Option<Resolved> {
    if value.is_definitely_null() {
        Some(Resolved::Null)
    } else if value.is_definitely_not_null() {
        Some(Resolved::NonNull)
    } else {
        None
    }
}

impl DataflowSemantics for NullnessAnalysis<'_> {
    type Fact = IsNullValueFrame;
    type Decision = BranchDecision<IsNullValue>;

    fn create_fact(&self) -> Self::Fact {
        Frame::new(self.entry.num_locals(), self.entry.max_stack())
    }

    fn init_entry_fact(&self, fact: &mut Self::Fact) {
        *fact = self.entry.clone();
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
        self.model.model(location, instruction, fact).map(|_| ())
    }

    fn branch_decision(
        &self,
        block: &BasicBlock,
        before_last: &Self::Fact,
        before_penultimate: Option<&Self::Fact>,
    ) -> Option<Self::Decision> {
        let last = block.instructions.len().checked_sub(1)?;
        let numbers = self
            .value_numbers()
            .fact_at_location(Location::new(block.id, last))
            .filter(|numbers| numbers.is_valid())?;
        match block.last()? {
            kind @ (InstructionKind::IfNull | InstructionKind::IfNonNull) => {
                let (null, non_null) = null_test_outcomes(*before_last.top_value().ok()?);
                let (taken, fall_through) = if *kind == InstructionKind::IfNull {
                    (null, non_null)
                } else {
                    (non_null, null)
                };
                BranchDecision::new(numbers.top_value()?, taken, fall_through)
            }
            kind @ (InstructionKind::IfRefEq | InstructionKind::IfRefNe) => {
                let right = *before_last.stack_value(0).ok()?;
                let left = *before_last.stack_value(1).ok()?;
                let (depth, other, known) = match (resolve(left), resolve(right)) {
                    (Some(known), None) => (0, right, known),
                    (None, Some(known)) => (1, left, known),
                    _ => return None,
                };
                let (equal, not_equal) = match known {
                    Resolved::Null => null_test_outcomes(other),
                    Resolved::NonNull => (non_null_outcome(other), Some(other)),
                };
                let (taken, fall_through) = if *kind == InstructionKind::IfRefEq {
                    (equal, not_equal)
                } else {
                    (not_equal, equal)
                };
                BranchDecision::new(numbers.stack_value(depth)?, taken, fall_through)
            }
            kind @ (InstructionKind::IfEq | InstructionKind::IfNe) => {
                if block.penultimate() != Some(&InstructionKind::InstanceOf) {
                    return None;
                }
                let value = *before_penultimate?.top_value().ok()?;
                let tested = self
                    .value_numbers()
                    .fact_at_location(Location::new(block.id, last - 1))
                    .filter(|numbers| numbers.is_valid())?
                    .top_value()?;
                let instance = non_null_outcome(value);
                let (taken, fall_through) = if *kind == InstructionKind::IfEq {
                    (Some(value), instance)
                } else {
                    (instance, Some(value))
                };
                BranchDecision::new(tested, taken, fall_through)
            }
            _ => None,
        }
    }

    fn apply_decision(&self, edge: &Edge, decision: &Self::Decision, fact: &mut Self::Fact) {
        let side = match edge.kind {
            EdgeKind::Branch => decision.taken(),
            EdgeKind::FallThrough => decision.fall_through(),
            EdgeKind::HandledException | EdgeKind::UnhandledException => return,
        };
        let last = self
            .model
            .graph
            .block(edge.from)
            .instructions
            .len()
            .saturating_sub(1);
        let numbers = self.value_numbers();
        match (
            numbers.fact_at_location(Location::new(edge.from, last)),
            numbers.start_fact(edge.to),
        ) {
            (Some(before_branch), Some(target)) => {
                decision.apply(edge.kind, before_branch, target, fact);
            }
            _ if side.is_none() => fact.set_top(),
            _ => {}
        }
        if !self.model.config.track_value_numbers {
            fact.clear_known_values();
        }
    }

    fn enter_exception_edge(&self, _edge: &Edge, fact: &mut Self::Fact) -> Result<()> {
        fact.reset_stack_to(IsNullValue::NonNullProven)
    }

    fn join_into(&self, _edge: &Edge, source: &Self::Fact, dest: &mut Self::Fact) -> Result<()> {
        dest.merge_with(source).map(|_| ())
    }
}

/// Converged nullness frames of one method with per-location queries.
pub(crate) struct NullnessDataflow<'a> {
    dataflow: Dataflow<'a, NullnessAnalysis<'a>>,
}

impl<'a> NullnessDataflow<'a> {
    pub(crate) fn execute(graph: &'a MethodGraph<'a>, analysis: NullnessAnalysis<'a>) -> Result<Self> {
        let dataflow = Dataflow::execute(graph, analysis).context("nullness dataflow")?;
        Ok(Self { dataflow })
    }

    pub(crate) fn graph(&self) -> &'a MethodGraph<'a> {
        self.dataflow.graph()
    }

    pub(crate) fn passes(&self) -> usize {
        self.dataflow.passes()
    }

    pub(crate) fn start_fact(&self, block: BlockId) -> &IsNullValueFrame {
        self.dataflow.start_fact(block)
    }

    pub(crate) fn fact_at_location(&self, location: Location) -> IsNullValueFrame {
        self.dataflow.fact_at_location(location)
    }

    pub(crate) fn fact_after_location(&self, location: Location) -> IsNullValueFrame {
        self.dataflow.fact_after_location(location)
    }

    /// Facts between the instructions of a block: `len + 1` entries.
    pub(crate) fn block_facts(&self, block: BlockId) -> Vec<IsNullValueFrame> {
        self.dataflow.block_facts(block)
    }

    /// Slot of a definitely-null value produced by the instruction at `location`.
    pub(crate) fn new_null_slot(&self, location: Location) -> Option<usize> {
        let instruction = self
            .graph()
            .block(location.block)
            .instructions
            .get(location.index)?;
        let mut frame = self.fact_at_location(location);
        self.dataflow
            .semantics()
            .model
            .model(location, instruction, &mut frame)
            .ok()?
            .new_null_slot
    }
}
