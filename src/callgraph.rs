use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::ir::{CallKind, CallSite, Class};

/// Unique identifier for a method in the program.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub(crate) struct MethodId {
    pub(crate) class_name: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl MethodId {
    pub(crate) fn new(class_name: &str, name: &str, descriptor: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    /// Method named by a call instruction, before dispatch.
    pub(crate) fn declared_by(call: &CallSite) -> Self {
        Self::new(&call.owner, &call.name, &call.descriptor)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class_name, self.name, self.descriptor)
    }
}

/// Resolves the concrete methods a call may dispatch to.
pub(crate) trait CallTargetResolver {
    /// Empty when the targets are unknown or outside the program.
    fn resolve(&self, call: &CallSite) -> Vec<MethodId>;
}

/// Class hierarchy of the analysed program, used for CHA resolution.
#[derive(Clone, Debug, Default)]
pub(crate) struct ClassHierarchy {
    supertypes: BTreeMap<String, Vec<String>>,
    descendants: BTreeMap<String, BTreeSet<String>>,
    methods: BTreeSet<MethodId>,
}

impl ClassHierarchy {
    pub(crate) fn new(classes: &[Class]) -> Self {
        let supertypes = build_supertypes(classes);
        let descendants = build_descendants(&supertypes);
        let methods = index_methods(classes);
        Self {
            supertypes,
            descendants,
            methods,
        }
    }

    /// Direct superclass first, then implemented interfaces.
    pub(crate) fn supertypes(&self, class_name: &str) -> &[String] {
        self.supertypes
            .get(class_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn declares(&self, method: &MethodId) -> bool {
        self.methods.contains(method)
    }

    /// Nearest declaration of `name`/`descriptor` at or above `class_name`.
    fn inherited(&self, class_name: &str, name: &str, descriptor: &str) -> Option<MethodId> {
        let mut queue = vec![class_name.to_string()];
        let mut seen = BTreeSet::new();
        let mut index = 0;
        while let Some(current) = queue.get(index).cloned() {
            index += 1;
            if !seen.insert(current.clone()) {
                continue;
            }
            let candidate = MethodId::new(&current, name, descriptor);
            if self.declares(&candidate) {
                return Some(candidate);
            }
            queue.extend(self.supertypes(&current).iter().cloned());
        }
        None
    }
}

impl CallTargetResolver for ClassHierarchy {
    fn resolve(&self, call: &CallSite) -> Vec<MethodId> {
        match call.kind {
            CallKind::Static | CallKind::Special => self
                .inherited(&call.owner, &call.name, &call.descriptor)
                .into_iter()
                .collect(),
            CallKind::Virtual | CallKind::Interface => {
                let mut targets = BTreeSet::new();
                if let Some(inherited) = self.inherited(&call.owner, &call.name, &call.descriptor)
                {
                    targets.insert(inherited);
                }
                if let Some(descendants) = self.descendants.get(&call.owner) {
                    for class_name in descendants {
                        let candidate = MethodId::new(class_name, &call.name, &call.descriptor);
                        if self.declares(&candidate) {
                            targets.insert(candidate);
                        }
                    }
                }
                targets.into_iter().collect()
            }
        }
    }
}

fn build_supertypes(classes: &[Class]) -> BTreeMap<String, Vec<String>> {
    let mut supertypes = BTreeMap::new();
    for class in classes {
        let mut direct = Vec::new();
        if let Some(super_name) = &class.super_name {
            direct.push(super_name.clone());
        }
        direct.extend(class.interfaces.iter().cloned());
        supertypes.insert(class.name.clone(), direct);
    }
    supertypes
}

fn build_descendants(
    supertypes: &BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (class_name, parents) in supertypes {
        for parent in parents {
            children
                .entry(parent.as_str())
                .or_default()
                .push(class_name.as_str());
        }
    }

    let mut descendants = BTreeMap::new();
    for root in children.keys() {
        let mut all = BTreeSet::new();
        let mut stack = vec![*root];
        while let Some(current) = stack.pop() {
            for child in children.get(current).into_iter().flatten() {
                if all.insert(child.to_string()) {
                    stack.push(*child);
                }
            }
        }
        descendants.insert(root.to_string(), all);
    }
    descendants
}

fn index_methods(classes: &[Class]) -> BTreeSet<MethodId> {
    classes
        .iter()
        .flat_map(|class| {
            class
                .methods
                .iter()
                .map(|method| MethodId::new(&class.name, &method.name, &method.descriptor))
        })
        .collect()
}
