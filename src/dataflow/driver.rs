use std::fmt;

use anyhow::{Result, bail};
use tracing::{debug, warn};

use crate::cfg::MethodGraph;
use crate::dataflow::frame::{Frame, FrameValue};
use crate::ir::{BasicBlock, BlockId, Edge, Instruction, Location};

/// State propagated by the fixpoint driver.
pub(crate) trait DataflowFact: Clone + PartialEq + fmt::Debug {
    fn is_top(&self) -> bool;
    fn set_top(&mut self);
}

impl<V: FrameValue> DataflowFact for Frame<V> {
    fn is_top(&self) -> bool {
        !self.is_valid()
    }

    fn set_top(&mut self) {
        Frame::set_top(self);
    }
}

/// Client callbacks required by the generic fixpoint driver.
pub(crate) trait DataflowSemantics {
    type Fact: DataflowFact;
    type Decision;

    /// A fresh TOP fact.
    fn create_fact(&self) -> Self::Fact;

    /// Turn a TOP fact into the state on method entry.
    fn init_entry_fact(&self, fact: &mut Self::Fact);

    /// Longest strictly ascending chain of a single fact.
    fn fact_height(&self) -> usize;

    /// Model one instruction. Errors invalidate the fact to TOP.
    fn transfer_instruction(
        &self,
        location: Location,
        instruction: &Instruction,
        fact: &mut Self::Fact,
    ) -> Result<()>;

    /// Refinement derived from a block's terminating comparison.
    ///
    /// `before_last` is the fact before the final instruction and
    /// `before_penultimate` the fact before the instruction preceding it.
    fn branch_decision(
        &self,
        _block: &BasicBlock,
        _before_last: &Self::Fact,
        _before_penultimate: Option<&Self::Fact>,
    ) -> Option<Self::Decision> {
        None
    }

    /// Refine a copy of the source block's result before it flows along `edge`.
    fn apply_decision(&self, _edge: &Edge, _decision: &Self::Decision, _fact: &mut Self::Fact) {}

    /// Adjust a fact flowing along an exception edge.
    fn enter_exception_edge(&self, edge: &Edge, fact: &mut Self::Fact) -> Result<()>;

    /// Join `source`, flowing along `edge`, into the successor's start fact.
    fn join_into(&self, edge: &Edge, source: &Self::Fact, dest: &mut Self::Fact) -> Result<()>;
}

/// Per-block fixpoint results for one method.
pub(crate) struct Dataflow<'a, S: DataflowSemantics> {
    graph: &'a MethodGraph<'a>,
    semantics: S,
    start: Vec<S::Fact>,
    result: Vec<S::Fact>,
    /// Facts before each instruction of a block that may throw.
    throwing: Vec<Vec<S::Fact>>,
    decisions: Vec<Option<S::Decision>>,
    passes: usize,
}

impl<'a, S: DataflowSemantics> Dataflow<'a, S> {
    /// Iterate blocks in reverse postorder until no start or result fact changes.
    ///
    /// Normal edges carry the source block's result fact, refined by its branch
    /// decision. Exception edges carry the facts before every instruction of
    /// the source block that may throw, or its start fact when none may.
    pub(crate) fn execute(graph: &'a MethodGraph<'a>, semantics: S) -> Result<Self> {
        let count = graph.block_count();
        let order = graph.reverse_postorder();
        let max_passes = count.max(1) * (semantics.fact_height() + 1) + 1;
        let mut dataflow = Self {
            graph,
            start: vec![semantics.create_fact(); count],
            result: vec![semantics.create_fact(); count],
            throwing: vec![Vec::new(); count],
            decisions: (0..count).map(|_| None).collect(),
            semantics,
            passes: 0,
        };

        loop {
            dataflow.passes += 1;
            if dataflow.passes > max_passes {
                bail!("dataflow did not converge within {max_passes} passes");
            }
            let mut changed = false;
            for &block in &order {
                let start = dataflow.compute_start(block)?;
                let (result, decision, throwing) = dataflow.transfer_block(block, start.clone());
                if start != dataflow.start[block.index()] {
                    dataflow.start[block.index()] = start;
                    changed = true;
                }
                if result != dataflow.result[block.index()] {
                    dataflow.result[block.index()] = result;
                    changed = true;
                }
                if throwing != dataflow.throwing[block.index()] {
                    dataflow.throwing[block.index()] = throwing;
                    changed = true;
                }
                dataflow.decisions[block.index()] = decision;
            }
            if !changed {
                break;
            }
        }
        debug!(
            "dataflow: blocks={} passes={} event=converged",
            count, dataflow.passes
        );
        Ok(dataflow)
    }

    fn compute_start(&self, block: BlockId) -> Result<S::Fact> {
        let mut start = self.semantics.create_fact();
        if block == self.graph.entry() {
            self.semantics.init_entry_fact(&mut start);
        }
        for edge in self.graph.incoming(block) {
            if edge.kind.is_exception() {
                for thrown in self.exception_sources(edge.from) {
                    if thrown.is_top() {
                        continue;
                    }
                    let mut incoming = thrown.clone();
                    self.semantics.enter_exception_edge(edge, &mut incoming)?;
                    self.semantics.join_into(edge, &incoming, &mut start)?;
                }
                continue;
            }
            let mut incoming = self.result[edge.from.index()].clone();
            if incoming.is_top() {
                continue;
            }
            if let Some(decision) = &self.decisions[edge.from.index()] {
                self.semantics.apply_decision(edge, decision, &mut incoming);
                if incoming.is_top() {
                    continue;
                }
            }
            self.semantics.join_into(edge, &incoming, &mut start)?;
        }
        Ok(start)
    }

    fn exception_sources(&self, block: BlockId) -> &[S::Fact] {
        let throwing = &self.throwing[block.index()];
        if throwing.is_empty() {
            std::slice::from_ref(&self.start[block.index()])
        } else {
            throwing
        }
    }

    fn transfer_block(
        &self,
        block: BlockId,
        mut fact: S::Fact,
    ) -> (S::Fact, Option<S::Decision>, Vec<S::Fact>) {
        let basic_block = self.graph.block(block);
        let len = basic_block.instructions.len();
        let mut before_last = None;
        let mut before_penultimate = None;
        let mut throwing = Vec::new();
        for (index, instruction) in basic_block.instructions.iter().enumerate() {
            if fact.is_top() {
                return (fact, None, throwing);
            }
            if instruction.kind.may_throw() {
                throwing.push(fact.clone());
            }
            if index + 2 == len {
                before_penultimate = Some(fact.clone());
            }
            if index + 1 == len {
                before_last = Some(fact.clone());
            }
            self.apply_instruction(Location::new(block, index), instruction, &mut fact);
        }
        let decision = match &before_last {
            Some(before_last) if !fact.is_top() => self.semantics.branch_decision(
                basic_block,
                before_last,
                before_penultimate.as_ref(),
            ),
            _ => None,
        };
        (fact, decision, throwing)
    }

    fn apply_instruction(&self, location: Location, instruction: &Instruction, fact: &mut S::Fact) {
        if let Err(err) = self.semantics.transfer_instruction(location, instruction, fact) {
            warn!(
                "dataflow: block={} index={} offset={} event=frame_invalidated error={err:#}",
                location.block, location.index, instruction.offset
            );
            fact.set_top();
        }
    }

    pub(crate) fn graph(&self) -> &'a MethodGraph<'a> {
        self.graph
    }

    pub(crate) fn semantics(&self) -> &S {
        &self.semantics
    }

    /// Number of reverse-postorder passes until the fixpoint was confirmed.
    pub(crate) fn passes(&self) -> usize {
        self.passes
    }

    pub(crate) fn start_fact(&self, block: BlockId) -> &S::Fact {
        &self.start[block.index()]
    }

    pub(crate) fn result_fact(&self, block: BlockId) -> &S::Fact {
        &self.result[block.index()]
    }

    pub(crate) fn decision(&self, block: BlockId) -> Option<&S::Decision> {
        self.decisions[block.index()].as_ref()
    }

    /// Fact immediately before the instruction at `location`.
    pub(crate) fn fact_at_location(&self, location: Location) -> S::Fact {
        self.replay(location.block, location.index)
    }

    /// Fact immediately after the instruction at `location`.
    pub(crate) fn fact_after_location(&self, location: Location) -> S::Fact {
        self.replay(location.block, location.index + 1)
    }

    /// Facts between the instructions of a block: `len + 1` entries.
    pub(crate) fn block_facts(&self, block: BlockId) -> Vec<S::Fact> {
        let instructions = &self.graph.block(block).instructions;
        let mut fact = self.start[block.index()].clone();
        let mut facts = Vec::with_capacity(instructions.len() + 1);
        facts.push(fact.clone());
        for (index, instruction) in instructions.iter().enumerate() {
            if !fact.is_top() {
                self.replay_instruction(Location::new(block, index), instruction, &mut fact);
            }
            facts.push(fact.clone());
        }
        facts
    }

    fn replay(&self, block: BlockId, upto: usize) -> S::Fact {
        let instructions = &self.graph.block(block).instructions;
        let mut fact = self.start[block.index()].clone();
        for (index, instruction) in instructions.iter().enumerate().take(upto) {
            if fact.is_top() {
                break;
            }
            self.replay_instruction(Location::new(block, index), instruction, &mut fact);
        }
        fact
    }

    /// Failures were already reported while executing.
    fn replay_instruction(&self, location: Location, instruction: &Instruction, fact: &mut S::Fact) {
        if self
            .semantics
            .transfer_instruction(location, instruction, fact)
            .is_err()
        {
            fact.set_top();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use anyhow::{Result, bail};

    use super::*;
    use crate::dataflow::frame::tests::Level;
    use crate::ir::{EdgeKind, InstructionKind};
    use crate::test_harness::{CfgBuilder, op};

    /// Counts loads along paths, saturating at a small ceiling.
    struct CountingSemantics {
        transfers: Cell<usize>,
        ceiling: u8,
    }

    impl CountingSemantics {
        fn new(ceiling: u8) -> Self {
            Self {
                transfers: Cell::new(0),
                ceiling,
            }
        }
    }

    impl DataflowSemantics for CountingSemantics {
        type Fact = Frame<Level>;
        type Decision = Level;

        fn create_fact(&self) -> Self::Fact {
            Frame::new(1, 2)
        }

        fn init_entry_fact(&self, fact: &mut Self::Fact) {
            fact.set_valid();
            fact.set_local(0, Level(1)).expect("entry local");
        }

        fn fact_height(&self) -> usize {
            usize::from(self.ceiling) + 1
        }

        fn transfer_instruction(
            &self,
            _location: Location,
            instruction: &Instruction,
            fact: &mut Self::Fact,
        ) -> Result<()> {
            self.transfers.set(self.transfers.get() + 1);
            match &instruction.kind {
                InstructionKind::Load { .. } => {
                    let next = Level((fact.local(0)?.0 + 1).min(self.ceiling));
                    fact.set_local(0, next)
                }
                InstructionKind::Pop => fact.pop().map(|_| ()),
                InstructionKind::ConstNull => fact.push(Level(0)),
                InstructionKind::IfEq => {
                    fact.pop()?;
                    Ok(())
                }
                InstructionKind::Throw => bail!("boom"),
                _ => Ok(()),
            }
        }

        fn branch_decision(
            &self,
            block: &BasicBlock,
            _before_last: &Self::Fact,
            _before_penultimate: Option<&Self::Fact>,
        ) -> Option<Self::Decision> {
            matches!(block.last(), Some(InstructionKind::IfEq)).then_some(Level(9))
        }

        fn apply_decision(&self, edge: &Edge, decision: &Self::Decision, fact: &mut Self::Fact) {
            if edge.kind == EdgeKind::Branch {
                fact.set_local(0, *decision).expect("refined local");
            }
        }

        fn enter_exception_edge(&self, _edge: &Edge, fact: &mut Self::Fact) -> Result<()> {
            fact.reset_stack_to(Level(3))
        }

        fn join_into(&self, _edge: &Edge, source: &Self::Fact, dest: &mut Self::Fact) -> Result<()> {
            dest.merge_with(source).map(|_| ())
        }
    }

    #[test]
    fn single_block_converges_in_two_passes() {
        let cfg = CfgBuilder::new()
            .block(vec![op::load(0), op::ret()])
            .exit()
            .edge(0, 1, EdgeKind::FallThrough)
            .build();
        let graph = MethodGraph::new(&cfg).expect("graph");

        let dataflow = Dataflow::execute(&graph, CountingSemantics::new(5)).expect("dataflow");

        assert_eq!(dataflow.passes(), 2);
        assert_eq!(*dataflow.result_fact(BlockId(0)).local(0).expect("local"), Level(2));
        assert_eq!(*dataflow.start_fact(BlockId(1)).local(0).expect("local"), Level(2));
    }

    #[test]
    fn loop_terminates_within_height_bound() {
        let cfg = CfgBuilder::new()
            .block(vec![op::nop()])
            .block(vec![op::load(0), op::goto()])
            .exit()
            .edge(0, 1, EdgeKind::FallThrough)
            .edge(1, 1, EdgeKind::Branch)
            .build();
        let graph = MethodGraph::new(&cfg).expect("graph");
        let semantics = CountingSemantics::new(6);
        let bound = graph.block_count() * semantics.fact_height();

        let dataflow = Dataflow::execute(&graph, semantics).expect("dataflow");

        assert!(dataflow.passes() <= bound, "passes {}", dataflow.passes());
        assert_eq!(*dataflow.result_fact(BlockId(1)).local(0).expect("local"), Level(6));
    }

    #[test]
    fn unreachable_block_stays_top() {
        let cfg = CfgBuilder::new()
            .block(vec![op::ret()])
            .block(vec![op::load(0)])
            .exit()
            .edge(0, 2, EdgeKind::FallThrough)
            .edge(1, 2, EdgeKind::FallThrough)
            .build();
        let graph = MethodGraph::new(&cfg).expect("graph");

        let dataflow = Dataflow::execute(&graph, CountingSemantics::new(5)).expect("dataflow");

        assert!(dataflow.start_fact(BlockId(1)).is_top());
        assert_eq!(*dataflow.start_fact(BlockId(2)).local(0).expect("local"), Level(1));
    }

    #[test]
    fn decision_refines_only_its_edge() {
        let cfg = CfgBuilder::new()
            .block(vec![op::const_null(), op::if_eq()])
            .block(vec![op::nop()])
            .block(vec![op::nop()])
            .exit()
            .edge(0, 1, EdgeKind::FallThrough)
            .edge(0, 2, EdgeKind::Branch)
            .edge(1, 3, EdgeKind::FallThrough)
            .edge(2, 3, EdgeKind::FallThrough)
            .build();
        let graph = MethodGraph::new(&cfg).expect("graph");

        let dataflow = Dataflow::execute(&graph, CountingSemantics::new(5)).expect("dataflow");

        assert_eq!(*dataflow.start_fact(BlockId(1)).local(0).expect("local"), Level(1));
        assert_eq!(*dataflow.start_fact(BlockId(2)).local(0).expect("local"), Level(9));
        assert_eq!(*dataflow.decision(BlockId(0)).expect("decision"), Level(9));
    }

    #[test]
    fn exception_edge_resets_stack() {
        let cfg = CfgBuilder::new()
            .block(vec![op::const_null(), op::pop()])
            .block(vec![op::pop()])
            .exit()
            .edge(0, 2, EdgeKind::FallThrough)
            .edge(0, 1, EdgeKind::HandledException)
            .edge(1, 2, EdgeKind::FallThrough)
            .build();
        let graph = MethodGraph::new(&cfg).expect("graph");

        let dataflow = Dataflow::execute(&graph, CountingSemantics::new(5)).expect("dataflow");

        assert_eq!(dataflow.start_fact(BlockId(1)).stack(), &[Level(3)]);
        assert_eq!(dataflow.result_fact(BlockId(1)).stack_depth(), 0);
    }

    #[test]
    fn exception_edge_sees_state_before_throwing_instruction() {
        let cfg = CfgBuilder::new()
            .block(vec![
                op::load(0),
                op::invoke_static("A", "m", "()V"),
                op::load(0),
            ])
            .block(vec![op::pop()])
            .exit()
            .edge(0, 2, EdgeKind::FallThrough)
            .edge(0, 1, EdgeKind::HandledException)
            .edge(1, 2, EdgeKind::FallThrough)
            .build();
        let graph = MethodGraph::new(&cfg).expect("graph");

        let dataflow = Dataflow::execute(&graph, CountingSemantics::new(5)).expect("dataflow");

        assert_eq!(*dataflow.start_fact(BlockId(1)).local(0).expect("local"), Level(2));
        assert_eq!(*dataflow.result_fact(BlockId(0)).local(0).expect("local"), Level(3));
    }

    #[test]
    fn failing_instruction_invalidates_only_its_frame() {
        let cfg = CfgBuilder::new()
            .block(vec![op::const_null(), op::if_eq()])
            .block(vec![op::throw()])
            .block(vec![op::load(0)])
            .exit()
            .edge(0, 1, EdgeKind::FallThrough)
            .edge(0, 2, EdgeKind::Branch)
            .edge(1, 3, EdgeKind::FallThrough)
            .edge(2, 3, EdgeKind::FallThrough)
            .build();
        let graph = MethodGraph::new(&cfg).expect("graph");

        let dataflow = Dataflow::execute(&graph, CountingSemantics::new(5)).expect("dataflow");

        assert!(dataflow.result_fact(BlockId(1)).is_top());
        assert!(!dataflow.result_fact(BlockId(2)).is_top());
        assert!(!dataflow.start_fact(BlockId(3)).is_top());
    }

    #[test]
    fn location_queries_replay_block() {
        let cfg = CfgBuilder::new()
            .block(vec![op::load(0), op::load(0), op::ret()])
            .exit()
            .edge(0, 1, EdgeKind::FallThrough)
            .build();
        let graph = MethodGraph::new(&cfg).expect("graph");

        let dataflow = Dataflow::execute(&graph, CountingSemantics::new(5)).expect("dataflow");
        let location = Location::new(BlockId(0), 1);

        assert_eq!(*dataflow.fact_at_location(location).local(0).expect("local"), Level(2));
        assert_eq!(*dataflow.fact_after_location(location).local(0).expect("local"), Level(3));
        assert_eq!(dataflow.block_facts(BlockId(0)).len(), 4);
    }
}
