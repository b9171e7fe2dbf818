use std::collections::BTreeSet;

use anyhow::{Context, Result};

use crate::cfg::MethodGraph;
use crate::dataflow::driver::{Dataflow, DataflowFact, DataflowSemantics};
use crate::ir::{BasicBlock, BlockId, Edge, EdgeKind, Instruction, InstructionKind, Location};

/// Names of methods whose result was compared against null on every path.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CheckedCalls {
    valid: bool,
    names: BTreeSet<String>,
}

impl CheckedCalls {
    fn top() -> Self {
        Self {
            valid: false,
            names: BTreeSet::new(),
        }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.valid && self.names.contains(name)
    }
}

impl DataflowFact for CheckedCalls {
    fn is_top(&self) -> bool {
        !self.valid
    }

    fn set_top(&mut self) {
        *self = Self::top();
    }
}

/// Edge on which a called method's result is known to be non-null.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CheckedEdge {
    name: String,
    kind: EdgeKind,
}

struct CheckedCallSemantics {
    fact_height: usize,
}

impl DataflowSemantics for CheckedCallSemantics {
    type Fact = CheckedCalls;
    type Decision = CheckedEdge;

    fn create_fact(&self) -> Self::Fact {
        CheckedCalls::top()
    }

    fn init_entry_fact(&self, fact: &mut Self::Fact) {
        fact.valid = true;
        fact.names.clear();
    }

    fn fact_height(&self) -> usize {
        self.fact_height
    }

    fn transfer_instruction(
        &self,
        _location: Location,
        _instruction: &Instruction,
        _fact: &mut Self::Fact,
    ) -> Result<()> {
        Ok(())
    }

    fn branch_decision(
        &self,
        block: &BasicBlock,
        _before_last: &Self::Fact,
        _before_penultimate: Option<&Self::Fact>,
    ) -> Option<Self::Decision> {
        let (name, kind) = match block.last()? {
            InstructionKind::IfNull | InstructionKind::IfNonNull => {
                let InstructionKind::Invoke(call) = block.penultimate()? else {
                    return None;
                };
                let kind = if block.last() == Some(&InstructionKind::IfNull) {
                    EdgeKind::FallThrough
                } else {
                    EdgeKind::Branch
                };
                (call.name.clone(), kind)
            }
            InstructionKind::IfRefEq | InstructionKind::IfRefNe => {
                let name = call_compared_with_null(block)?;
                let kind = if block.last() == Some(&InstructionKind::IfRefEq) {
                    EdgeKind::FallThrough
                } else {
                    EdgeKind::Branch
                };
                (name, kind)
            }
            _ => return None,
        };
        Some(CheckedEdge { name, kind })
    }

    fn apply_decision(&self, edge: &Edge, decision: &Self::Decision, fact: &mut Self::Fact) {
        if edge.kind == decision.kind && fact.valid {
            fact.names.insert(decision.name.clone());
        }
    }

    fn enter_exception_edge(&self, _edge: &Edge, _fact: &mut Self::Fact) -> Result<()> {
        Ok(())
    }

    fn join_into(&self, _edge: &Edge, source: &Self::Fact, dest: &mut Self::Fact) -> Result<()> {
        if !source.valid {
            return Ok(());
        }
        if !dest.valid {
            *dest = source.clone();
            return Ok(());
        }
        dest.names.retain(|name| source.names.contains(name));
        Ok(())
    }
}

/// Name of the call compared by a trailing reference comparison against `null`.
///
/// Matches `call; aconst_null; if_acmp` and `aconst_null; <args>; call; if_acmp`,
/// locating the constant by counting stack effects backwards.
fn call_compared_with_null(block: &BasicBlock) -> Option<String> {
    let len = block.instructions.len();
    match block.penultimate()? {
        InstructionKind::ConstNull => {
            let InstructionKind::Invoke(call) = &block.instructions.get(len.checked_sub(3)?)?.kind
            else {
                return None;
            };
            Some(call.name.clone())
        }
        InstructionKind::Invoke(call) => {
            let effect = block.penultimate()?.stack_effect().ok()?;
            let mut needed = (2 + effect.pops).checked_sub(effect.pushes)?;
            for instruction in block.instructions[..len - 2].iter().rev() {
                let effect = instruction.kind.stack_effect().ok()?;
                needed = needed.checked_sub(effect.pushes)?;
                if needed == 0 {
                    return (instruction.kind == InstructionKind::ConstNull)
                        .then(|| call.name.clone());
                }
                needed += effect.pops;
            }
            None
        }
        _ => None,
    }
}

/// Block-start checked-call sets for one method.
pub(crate) struct CheckedCallTable {
    starts: Vec<CheckedCalls>,
}

impl CheckedCallTable {
    pub(crate) fn compute(graph: &MethodGraph<'_>) -> Result<Self> {
        let names: BTreeSet<&str> = graph
            .cfg()
            .blocks
            .iter()
            .flat_map(|block| &block.instructions)
            .filter_map(|instruction| match &instruction.kind {
                InstructionKind::Invoke(call) => Some(call.name.as_str()),
                _ => None,
            })
            .collect();
        let semantics = CheckedCallSemantics {
            fact_height: names.len() + 2,
        };
        let dataflow = Dataflow::execute(graph, semantics).context("checked calls")?;
        let starts = (0..graph.block_count())
            .map(|index| dataflow.start_fact(BlockId(index)).clone())
            .collect();
        Ok(Self { starts })
    }

    /// Whether `name`'s result was null-checked on every path into `block`.
    pub(crate) fn contains(&self, block: BlockId, name: &str) -> bool {
        self.starts
            .get(block.index())
            .is_some_and(|fact| fact.contains(name))
    }
}
