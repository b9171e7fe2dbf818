use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Count parameters in a JVM method descriptor.
pub(crate) fn method_param_count(descriptor: &str) -> Result<usize> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    Ok(descriptor.parameter_types().len())
}

/// Return kind of a JVM method descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ReturnKind {
    Void,
    Primitive,
    Reference,
}

/// Determine the return kind from a JVM method descriptor.
pub(crate) fn method_return_kind(descriptor: &str) -> Result<ReturnKind> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    let kind = match descriptor.return_type() {
        TypeDescriptor::Void => ReturnKind::Void,
        TypeDescriptor::Object(_) | TypeDescriptor::Array(_, _) => ReturnKind::Reference,
        _ => ReturnKind::Primitive,
    };
    Ok(kind)
}

/// Local-variable slot of each declared parameter, in declaration order.
///
/// Instance methods reserve slot 0 for the receiver, and `long`/`double`
/// parameters occupy two slots.
pub(crate) fn parameter_slots(descriptor: &str, is_static: bool) -> Result<Vec<usize>> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    let mut slot = usize::from(!is_static);
    let mut slots = Vec::new();
    for param in descriptor.parameter_types() {
        slots.push(slot);
        slot += if matches!(param, TypeDescriptor::Long | TypeDescriptor::Double) {
            2
        } else {
            1
        };
    }
    Ok(slots)
}

/// Whether each declared parameter is a reference type.
pub(crate) fn reference_parameters(descriptor: &str) -> Result<Vec<bool>> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    Ok(descriptor
        .parameter_types()
        .iter()
        .map(|param| matches!(param, TypeDescriptor::Object(_) | TypeDescriptor::Array(_, _)))
        .collect())
}

/// Whether a field descriptor names a reference type.
pub(crate) fn is_reference_field(descriptor: &str) -> bool {
    descriptor.starts_with('L') || descriptor.starts_with('[')
}
