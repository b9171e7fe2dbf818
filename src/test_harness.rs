use crate::ir::{
    BasicBlock, BlockId, CallKind, CallSite, Cfg, Class, Edge, EdgeKind, FieldRef, Instruction,
    InstructionKind, Method, MethodAccess, MethodNullness, Nullness,
};

/// Builder for hand-written CFG fixtures; the first block is the entry.
pub(crate) struct CfgBuilder {
    blocks: Vec<BasicBlock>,
    edges: Vec<Edge>,
    exit: Option<BlockId>,
    next_offset: u32,
}

impl CfgBuilder {
    pub(crate) fn new() -> Self {
        Self {
            blocks: Vec::new(),
            edges: Vec::new(),
            exit: None,
            next_offset: 0,
        }
    }

    pub(crate) fn block(mut self, kinds: Vec<InstructionKind>) -> Self {
        let id = BlockId(self.blocks.len());
        let instructions = kinds
            .into_iter()
            .map(|kind| {
                let offset = self.next_offset;
                self.next_offset += 1;
                Instruction { offset, kind }
            })
            .collect();
        self.blocks.push(BasicBlock { id, instructions });
        self
    }

    /// Append the empty exit block.
    pub(crate) fn exit(mut self) -> Self {
        self.exit = Some(BlockId(self.blocks.len()));
        self.block(Vec::new())
    }

    pub(crate) fn edge(mut self, from: usize, to: usize, kind: EdgeKind) -> Self {
        self.edges.push(Edge {
            from: BlockId(from),
            to: BlockId(to),
            kind,
        });
        self
    }

    pub(crate) fn build(self) -> Cfg {
        let exit = self
            .exit
            .unwrap_or_else(|| BlockId(self.blocks.len().saturating_sub(1)));
        Cfg {
            entry: BlockId(0),
            exit,
            blocks: self.blocks,
            edges: self.edges,
        }
    }
}

/// Public static method with room for a handful of locals and stack cells.
pub(crate) fn static_method(name: &str, descriptor: &str, cfg: Cfg) -> Method {
    Method {
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        access: MethodAccess {
            is_public: true,
            is_static: true,
            is_abstract: false,
        },
        nullness: MethodNullness::default(),
        max_locals: 4,
        max_stack: 4,
        cfg: Some(cfg),
        dereferenced_parameters: Vec::new(),
    }
}

/// Public instance method; slot 0 holds the receiver.
pub(crate) fn instance_method(name: &str, descriptor: &str, cfg: Cfg) -> Method {
    let mut method = static_method(name, descriptor, cfg);
    method.access.is_static = false;
    method
}

/// Bodiless method carrying only a return annotation.
pub(crate) fn declared_method(name: &str, descriptor: &str, returns: Nullness) -> Method {
    Method {
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        access: MethodAccess {
            is_public: true,
            is_static: false,
            is_abstract: true,
        },
        nullness: MethodNullness {
            return_nullness: returns,
            parameter_nullness: Vec::new(),
        },
        max_locals: 0,
        max_stack: 0,
        cfg: None,
        dereferenced_parameters: Vec::new(),
    }
}

pub(crate) fn class(name: &str, methods: Vec<Method>) -> Class {
    Class {
        name: name.to_string(),
        super_name: Some("java/lang/Object".to_string()),
        interfaces: Vec::new(),
        is_interface: false,
        is_abstract: false,
        is_application: true,
        fields: Vec::new(),
        methods,
    }
}

/// Shorthand instruction constructors.
pub(crate) mod op {
    use super::*;

    pub(crate) fn nop() -> InstructionKind {
        InstructionKind::Nop
    }

    pub(crate) fn const_null() -> InstructionKind {
        InstructionKind::ConstNull
    }

    pub(crate) fn const_int() -> InstructionKind {
        InstructionKind::ConstPrimitive
    }

    pub(crate) fn load(slot: usize) -> InstructionKind {
        InstructionKind::Load { slot }
    }

    pub(crate) fn store(slot: usize) -> InstructionKind {
        InstructionKind::Store { slot }
    }

    pub(crate) fn pop() -> InstructionKind {
        InstructionKind::Pop
    }

    pub(crate) fn dup() -> InstructionKind {
        InstructionKind::Dup
    }

    pub(crate) fn new(class: &str) -> InstructionKind {
        InstructionKind::New {
            class: class.to_string(),
        }
    }

    fn field(owner: &str, name: &str, descriptor: &str) -> FieldRef {
        FieldRef {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    pub(crate) fn get_field(owner: &str, name: &str, descriptor: &str) -> InstructionKind {
        InstructionKind::GetField(field(owner, name, descriptor))
    }

    pub(crate) fn put_field(owner: &str, name: &str, descriptor: &str) -> InstructionKind {
        InstructionKind::PutField(field(owner, name, descriptor))
    }

    pub(crate) fn get_static(owner: &str, name: &str, descriptor: &str) -> InstructionKind {
        InstructionKind::GetStatic(field(owner, name, descriptor))
    }

    pub(crate) fn invoke(
        kind: CallKind,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> InstructionKind {
        InstructionKind::Invoke(CallSite {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            kind,
        })
    }

    pub(crate) fn invoke_static(owner: &str, name: &str, descriptor: &str) -> InstructionKind {
        invoke(CallKind::Static, owner, name, descriptor)
    }

    pub(crate) fn invoke_virtual(owner: &str, name: &str, descriptor: &str) -> InstructionKind {
        invoke(CallKind::Virtual, owner, name, descriptor)
    }

    pub(crate) fn array_load() -> InstructionKind {
        InstructionKind::ArrayLoad
    }

    pub(crate) fn array_store() -> InstructionKind {
        InstructionKind::ArrayStore
    }

    pub(crate) fn instance_of() -> InstructionKind {
        InstructionKind::InstanceOf
    }

    pub(crate) fn if_null() -> InstructionKind {
        InstructionKind::IfNull
    }

    pub(crate) fn if_non_null() -> InstructionKind {
        InstructionKind::IfNonNull
    }

    pub(crate) fn if_ref_eq() -> InstructionKind {
        InstructionKind::IfRefEq
    }

    pub(crate) fn if_ref_ne() -> InstructionKind {
        InstructionKind::IfRefNe
    }

    pub(crate) fn if_eq() -> InstructionKind {
        InstructionKind::IfEq
    }

    pub(crate) fn goto() -> InstructionKind {
        InstructionKind::Goto
    }

    pub(crate) fn ret() -> InstructionKind {
        InstructionKind::Return
    }

    pub(crate) fn throw() -> InstructionKind {
        InstructionKind::Throw
    }
}
