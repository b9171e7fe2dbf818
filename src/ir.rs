use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::descriptor::{ReturnKind, method_param_count, method_return_kind};

/// Decoded program handed to an analysis session.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct Program {
    pub(crate) classes: Vec<Class>,
}

impl Program {
    pub(crate) fn class(&self, name: &str) -> Option<&Class> {
        self.classes.iter().find(|class| class.name == name)
    }
}

/// Intermediate representation for a decoded JVM class.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Class {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) super_name: Option<String>,
    #[serde(default)]
    pub(crate) interfaces: Vec<String>,
    #[serde(default)]
    pub(crate) is_interface: bool,
    #[serde(default)]
    pub(crate) is_abstract: bool,
    /// Application classes are analysed; library classes only supply facts.
    #[serde(default = "default_true")]
    pub(crate) is_application: bool,
    #[serde(default)]
    pub(crate) fields: Vec<Field>,
    #[serde(default)]
    pub(crate) methods: Vec<Method>,
}

impl Class {
    pub(crate) fn method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }

    pub(crate) fn field(&self, name: &str, descriptor: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|field| field.name == name && field.descriptor == descriptor)
    }
}

fn default_true() -> bool {
    true
}

/// Field declaration with its nullness annotation.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    #[serde(default)]
    pub(crate) is_static: bool,
    #[serde(default)]
    pub(crate) nullness: Nullness,
}

/// Intermediate representation for a method and its control-flow graph.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    #[serde(default)]
    pub(crate) access: MethodAccess,
    #[serde(default)]
    pub(crate) nullness: MethodNullness,
    #[serde(default)]
    pub(crate) max_locals: usize,
    #[serde(default)]
    pub(crate) max_stack: usize,
    /// Absent for abstract and native methods.
    #[serde(default)]
    pub(crate) cfg: Option<Cfg>,
    /// Parameters the method dereferences on every path before returning.
    #[serde(default)]
    pub(crate) dereferenced_parameters: Vec<usize>,
}

/// Method access flags relevant to analysis.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub(crate) struct MethodAccess {
    #[serde(default)]
    pub(crate) is_public: bool,
    #[serde(default)]
    pub(crate) is_static: bool,
    #[serde(default)]
    pub(crate) is_abstract: bool,
}

/// Nullness annotations attached to a method signature.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct MethodNullness {
    #[serde(default)]
    pub(crate) return_nullness: Nullness,
    #[serde(default)]
    pub(crate) parameter_nullness: Vec<Nullness>,
}

/// Declared or inferred nullness annotation.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Nullness {
    NonNull,
    CheckForNull,
    Nullable,
    #[default]
    Unknown,
}

/// Dense basic block identifier assigned when the CFG is built.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq, Hash, Ord, PartialOrd,
)]
#[serde(transparent)]
pub(crate) struct BlockId(pub(crate) usize);

impl BlockId {
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Control-flow graph of a method body.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Cfg {
    pub(crate) entry: BlockId,
    pub(crate) exit: BlockId,
    pub(crate) blocks: Vec<BasicBlock>,
    #[serde(default)]
    pub(crate) edges: Vec<Edge>,
}

/// Straight-line instruction sequence.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct BasicBlock {
    pub(crate) id: BlockId,
    #[serde(default)]
    pub(crate) instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub(crate) fn last(&self) -> Option<&InstructionKind> {
        self.instructions.last().map(|instruction| &instruction.kind)
    }

    /// Instruction before the terminating one, if any.
    pub(crate) fn penultimate(&self) -> Option<&InstructionKind> {
        let len = self.instructions.len();
        if len < 2 {
            return None;
        }
        Some(&self.instructions[len - 2].kind)
    }

    pub(crate) fn ends_in_throw(&self) -> bool {
        matches!(self.last(), Some(InstructionKind::Throw))
    }
}

/// Directed control-flow edge between basic blocks.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub(crate) struct Edge {
    pub(crate) from: BlockId,
    pub(crate) to: BlockId,
    pub(crate) kind: EdgeKind,
}

/// Edge classification.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub(crate) enum EdgeKind {
    FallThrough,
    /// Conditional-taken, goto and switch targets.
    Branch,
    HandledException,
    /// Exception leaving the method, always targets the exit block.
    UnhandledException,
}

impl EdgeKind {
    pub(crate) fn is_exception(self) -> bool {
        matches!(self, Self::HandledException | Self::UnhandledException)
    }
}

/// Program point: the `index`-th instruction of `block`.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq, Hash, Ord, PartialOrd,
)]
pub(crate) struct Location {
    pub(crate) block: BlockId,
    pub(crate) index: usize,
}

impl Location {
    pub(crate) fn new(block: BlockId, index: usize) -> Self {
        Self { block, index }
    }
}

/// Bytecode instruction captured for analysis.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Instruction {
    #[serde(default)]
    pub(crate) offset: u32,
    #[serde(flatten)]
    pub(crate) kind: InstructionKind,
}

/// Instruction categories distinguished by the analyses.
///
/// Operand-stack cells hold one value each, so `long` and `double` values
/// occupy a single stack cell.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum InstructionKind {
    Nop,
    ConstNull,
    ConstPrimitive,
    /// `ldc` of a string, class or method-handle constant.
    ConstReference,
    Load {
        slot: usize,
    },
    Store {
        slot: usize,
    },
    Pop,
    Dup,
    DupX1,
    Swap,
    New {
        class: String,
    },
    NewArray,
    MultiNewArray {
        dimensions: usize,
    },
    GetField(FieldRef),
    PutField(FieldRef),
    GetStatic(FieldRef),
    PutStatic(FieldRef),
    ArrayLoad,
    ArrayStore,
    ArrayLength,
    Invoke(CallSite),
    CheckCast,
    InstanceOf,
    /// Primitive computation popping `pops` values and pushing `pushes`.
    Arithmetic {
        pops: usize,
        pushes: usize,
    },
    IfNull,
    IfNonNull,
    IfRefEq,
    IfRefNe,
    /// `ifeq`: branch when the popped int is zero.
    IfEq,
    /// `ifne`: branch when the popped int is non-zero.
    IfNe,
    /// Any other integer comparison branch.
    IfCompare {
        operands: usize,
    },
    Goto,
    Switch,
    Return,
    ReturnValue,
    Throw,
    MonitorEnter,
    MonitorExit,
}

/// Values an instruction pops from and pushes onto the operand stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct StackEffect {
    pub(crate) pops: usize,
    pub(crate) pushes: usize,
}

impl StackEffect {
    fn new(pops: usize, pushes: usize) -> Self {
        Self { pops, pushes }
    }
}

impl InstructionKind {
    /// Net stack effect; stack shuffles report their generic shape.
    pub(crate) fn stack_effect(&self) -> Result<StackEffect> {
        let effect = match self {
            Self::Nop | Self::Goto | Self::Return | Self::CheckCast => StackEffect::new(0, 0),
            Self::ConstNull | Self::ConstPrimitive | Self::ConstReference => {
                StackEffect::new(0, 1)
            }
            Self::Load { .. } | Self::New { .. } | Self::GetStatic(_) => StackEffect::new(0, 1),
            Self::Store { .. } | Self::Pop | Self::PutStatic(_) => StackEffect::new(1, 0),
            Self::Dup => StackEffect::new(1, 2),
            Self::DupX1 => StackEffect::new(2, 3),
            Self::Swap => StackEffect::new(2, 2),
            Self::NewArray
            | Self::GetField(_)
            | Self::ArrayLength
            | Self::InstanceOf => StackEffect::new(1, 1),
            Self::MultiNewArray { dimensions } => StackEffect::new(*dimensions, 1),
            Self::PutField(_) => StackEffect::new(2, 0),
            Self::ArrayLoad => StackEffect::new(2, 1),
            Self::ArrayStore => StackEffect::new(3, 0),
            Self::Invoke(call) => {
                let pushes = match method_return_kind(&call.descriptor)? {
                    ReturnKind::Void => 0,
                    ReturnKind::Primitive | ReturnKind::Reference => 1,
                };
                StackEffect::new(call.consumed_values()?, pushes)
            }
            Self::Arithmetic { pops, pushes } => StackEffect::new(*pops, *pushes),
            Self::IfNull
            | Self::IfNonNull
            | Self::IfEq
            | Self::IfNe
            | Self::Switch
            | Self::ReturnValue
            | Self::Throw
            | Self::MonitorEnter
            | Self::MonitorExit => StackEffect::new(1, 0),
            Self::IfRefEq | Self::IfRefNe => StackEffect::new(2, 0),
            Self::IfCompare { operands } => StackEffect::new(*operands, 0),
        };
        Ok(effect)
    }

    /// Whether the instruction can raise an exception that a handler may catch.
    pub(crate) fn may_throw(&self) -> bool {
        matches!(
            self,
            Self::New { .. }
                | Self::NewArray
                | Self::MultiNewArray { .. }
                | Self::GetField(_)
                | Self::PutField(_)
                | Self::GetStatic(_)
                | Self::PutStatic(_)
                | Self::ArrayLoad
                | Self::ArrayStore
                | Self::ArrayLength
                | Self::Invoke(_)
                | Self::CheckCast
                | Self::Arithmetic { .. }
                | Self::Throw
                | Self::MonitorEnter
                | Self::MonitorExit
        )
    }

    pub(crate) fn is_null_test(&self) -> bool {
        matches!(self, Self::IfNull | Self::IfNonNull)
    }
}

/// Field reference resolved from the constant pool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct FieldRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

/// Call site extracted from bytecode.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct CallSite {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
}

impl CallSite {
    /// Stack values consumed: arguments plus the receiver of instance calls.
    pub(crate) fn consumed_values(&self) -> Result<usize> {
        let params = method_param_count(&self.descriptor)?;
        Ok(params + usize::from(self.kind != CallKind::Static))
    }
}

/// Call opcode classification used by CHA.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tagged_instructions() {
        let json = r#"[
            {"offset": 0, "op": "load", "slot": 1},
            {"offset": 1, "op": "get_field", "owner": "A", "name": "f", "descriptor": "LB;"},
            {"offset": 4, "op": "invoke", "owner": "A", "name": "m", "descriptor": "(I)V", "kind": "virtual"},
            {"offset": 7, "op": "if_null"}
        ]"#;

        let instructions: Vec<Instruction> = serde_json::from_str(json).expect("instructions");

        assert_eq!(instructions[0].kind, InstructionKind::Load { slot: 1 });
        assert!(matches!(&instructions[1].kind, InstructionKind::GetField(field) if field.name == "f"));
        assert!(matches!(&instructions[2].kind, InstructionKind::Invoke(call) if call.kind == CallKind::Virtual));
        assert_eq!(instructions[3].offset, 7);
        assert!(instructions[3].kind.is_null_test());
    }

    #[test]
    fn invoke_stack_effect_counts_receiver() {
        let call = InstructionKind::Invoke(CallSite {
            owner: "A".to_string(),
            name: "m".to_string(),
            descriptor: "(ILjava/lang/Object;)Ljava/lang/String;".to_string(),
            kind: CallKind::Interface,
        });

        assert_eq!(call.stack_effect().expect("effect"), StackEffect::new(3, 1));
    }

    #[test]
    fn class_defaults_to_application() {
        let class: Class = serde_json::from_str(r#"{"name": "A"}"#).expect("class");

        assert!(class.is_application);
        assert!(class.methods.is_empty());
    }
}
