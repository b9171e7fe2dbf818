use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::callgraph::{ClassHierarchy, MethodId};
use crate::ir::{CallSite, Class, FieldRef, Method, Nullness};

/// Declared or inferred nullness of fields, returns and parameters.
pub(crate) trait NullnessAnnotations {
    fn field_nullness(&self, field: &FieldRef) -> Nullness;
    fn return_nullness(&self, method: &MethodId) -> Nullness;
    fn parameter_nullness(&self, method: &MethodId, parameter: usize) -> Nullness;
}

/// Arguments every possible callee requires to be non-null.
pub(crate) trait NonNullParameters {
    /// Argument indices, 0 being the first declared parameter.
    fn non_null_parameters(&self, call: &CallSite, targets: &[MethodId]) -> BTreeSet<usize>;
}

/// Annotation facts read from the decoded program.
///
/// Unknown method annotations are inherited from the nearest supertype
/// declaration of the same method.
pub(crate) struct ProgramAnnotations<'p> {
    classes: BTreeMap<&'p str, &'p Class>,
    hierarchy: &'p ClassHierarchy,
}

impl<'p> ProgramAnnotations<'p> {
    pub(crate) fn new(classes: &'p [Class], hierarchy: &'p ClassHierarchy) -> Self {
        Self {
            classes: classes
                .iter()
                .map(|class| (class.name.as_str(), class))
                .collect(),
            hierarchy,
        }
    }

    fn method(&self, id: &MethodId) -> Option<&'p Method> {
        self.classes
            .get(id.class_name.as_str())?
            .method(&id.name, &id.descriptor)
    }

    /// First known answer walking from the declaring class to its supertypes.
    fn resolve<F>(&self, id: &MethodId, lookup: F) -> Nullness
    where
        F: Fn(&Method) -> Nullness,
    {
        let mut queue = vec![id.class_name.clone()];
        let mut seen = BTreeSet::new();
        let mut index = 0;
        while let Some(class_name) = queue.get(index).cloned() {
            index += 1;
            if !seen.insert(class_name.clone()) {
                continue;
            }
            let candidate = MethodId::new(&class_name, &id.name, &id.descriptor);
            if let Some(method) = self.method(&candidate) {
                let nullness = lookup(method);
                if nullness != Nullness::Unknown {
                    return nullness;
                }
            }
            queue.extend(self.hierarchy.supertypes(&class_name).iter().cloned());
        }
        if seen.len() == 1 && !self.classes.contains_key(id.class_name.as_str()) {
            debug!("annotations: class={} event=missing_class", id.class_name);
        }
        Nullness::Unknown
    }
}

impl NullnessAnnotations for ProgramAnnotations<'_> {
    fn field_nullness(&self, field: &FieldRef) -> Nullness {
        let mut current = Some(field.owner.as_str());
        while let Some(class_name) = current {
            let Some(class) = self.classes.get(class_name) else {
                break;
            };
            if let Some(declared) = class.field(&field.name, &field.descriptor) {
                return declared.nullness;
            }
            current = class.super_name.as_deref();
        }
        Nullness::Unknown
    }

    fn return_nullness(&self, method: &MethodId) -> Nullness {
        self.resolve(method, |declared| declared.nullness.return_nullness)
    }

    fn parameter_nullness(&self, method: &MethodId, parameter: usize) -> Nullness {
        self.resolve(method, |declared| {
            declared
                .nullness
                .parameter_nullness
                .get(parameter)
                .copied()
                .unwrap_or_default()
        })
    }
}

impl NonNullParameters for ProgramAnnotations<'_> {
    fn non_null_parameters(&self, call: &CallSite, targets: &[MethodId]) -> BTreeSet<usize> {
        let declared = [MethodId::declared_by(call)];
        let targets = if targets.is_empty() {
            &declared[..]
        } else {
            targets
        };

        let mut required: Option<BTreeSet<usize>> = None;
        for target in targets {
            let Some(method) = self.method(target) else {
                return BTreeSet::new();
            };
            let mut parameters: BTreeSet<usize> =
                method.dereferenced_parameters.iter().copied().collect();
            for index in 0..method.nullness.parameter_nullness.len() {
                if self.parameter_nullness(target, index) == Nullness::NonNull {
                    parameters.insert(index);
                }
            }
            required = Some(match required {
                Some(previous) => previous.intersection(&parameters).copied().collect(),
                None => parameters,
            });
        }
        required.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CallKind, Field};
    use crate::test_harness::{class, declared_method};

    fn program() -> Vec<Class> {
        let mut base_get = declared_method("get", "()Ljava/lang/Object;", Nullness::CheckForNull);
        base_get.nullness.parameter_nullness = Vec::new();
        let mut base = class("com/example/Base", vec![base_get]);
        base.fields.push(Field {
            name: "name".to_string(),
            descriptor: "Ljava/lang/String;".to_string(),
            is_static: false,
            nullness: Nullness::NonNull,
        });

        let sub_get = declared_method("get", "()Ljava/lang/Object;", Nullness::Unknown);
        let mut put = declared_method("put", "(Ljava/lang/Object;Ljava/lang/Object;)V", Nullness::Unknown);
        put.nullness.parameter_nullness = vec![Nullness::NonNull, Nullness::Unknown];
        put.dereferenced_parameters = vec![1];
        let mut sub = class("com/example/Sub", vec![sub_get, put]);
        sub.super_name = Some("com/example/Base".to_string());
        vec![base, sub]
    }

    #[test]
    fn unknown_return_is_inherited_from_supertype() {
        let classes = program();
        let hierarchy = ClassHierarchy::new(&classes);
        let annotations = ProgramAnnotations::new(&classes, &hierarchy);

        let nullness = annotations.return_nullness(&MethodId::new(
            "com/example/Sub",
            "get",
            "()Ljava/lang/Object;",
        ));

        assert_eq!(nullness, Nullness::CheckForNull);
    }

    #[test]
    fn field_lookup_walks_superclasses() {
        let classes = program();
        let hierarchy = ClassHierarchy::new(&classes);
        let annotations = ProgramAnnotations::new(&classes, &hierarchy);

        let field = FieldRef {
            owner: "com/example/Sub".to_string(),
            name: "name".to_string(),
            descriptor: "Ljava/lang/String;".to_string(),
        };

        assert_eq!(annotations.field_nullness(&field), Nullness::NonNull);
    }

    #[test]
    fn missing_class_is_unknown() {
        let classes = program();
        let hierarchy = ClassHierarchy::new(&classes);
        let annotations = ProgramAnnotations::new(&classes, &hierarchy);

        let nullness =
            annotations.return_nullness(&MethodId::new("java/util/Map", "get", "()V"));

        assert_eq!(nullness, Nullness::Unknown);
    }

    #[test]
    fn non_null_parameters_combine_annotations_and_dereferences() {
        let classes = program();
        let hierarchy = ClassHierarchy::new(&classes);
        let annotations = ProgramAnnotations::new(&classes, &hierarchy);
        let call = CallSite {
            owner: "com/example/Sub".to_string(),
            name: "put".to_string(),
            descriptor: "(Ljava/lang/Object;Ljava/lang/Object;)V".to_string(),
            kind: CallKind::Virtual,
        };

        let parameters = annotations.non_null_parameters(&call, &[]);

        assert_eq!(parameters, BTreeSet::from([0, 1]));
    }
}
