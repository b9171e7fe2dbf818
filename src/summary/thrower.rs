use std::collections::BTreeSet;

use anyhow::{Context, Result};
use tracing::debug;

use crate::cfg::MethodGraph;
use crate::descriptor::parameter_slots;
use crate::ir::{Class, EdgeKind, InstructionKind, Method};
use crate::summary::MethodSummary;

/// Classify an eligible method as an exception thrower.
///
/// Returns `None` for methods that are not summarized: those outside
/// application classes, in interfaces or abstract classes, non-public
/// instance methods, and methods without a body.
pub(crate) fn summarize_method(class: &Class, method: &Method) -> Result<Option<MethodSummary>> {
    if !is_eligible(class, method) {
        return Ok(None);
    }
    let Some(cfg) = &method.cfg else {
        return Ok(None);
    };
    let graph = MethodGraph::new(cfg)?;

    if always_throws(&graph) {
        return Ok(Some(MethodSummary::AlwaysThrows));
    }
    let slots = parameter_slots(&method.descriptor, method.access.is_static)
        .with_context(|| format!("parameters of {}{}", method.name, method.descriptor))?;
    if slots.is_empty() {
        return Ok(Some(MethodSummary::None));
    }
    match guarded_parameters(&graph, &slots) {
        Some(parameters) if !parameters.is_empty() => {
            debug!(
                "thrower: class={} method={}{} parameters={:?} event=conditional",
                class.name, method.name, method.descriptor, parameters
            );
            Ok(Some(MethodSummary::Conditional(parameters)))
        }
        _ => Ok(Some(MethodSummary::None)),
    }
}

fn is_eligible(class: &Class, method: &Method) -> bool {
    class.is_application
        && !class.is_interface
        && !class.is_abstract
        && !method.access.is_abstract
        && (method.access.is_static || method.access.is_public)
}

/// Every edge into the exit is an unhandled exception or leaves a `throw`.
fn always_throws(graph: &MethodGraph<'_>) -> bool {
    graph.incoming(graph.exit()).iter().all(|edge| {
        edge.kind == EdgeKind::UnhandledException || graph.block(edge.from).ends_in_throw()
    })
}

/// Parameters whose null check guards a throwing path.
///
/// Explores the graph from the entry without following the edge on which a
/// checked parameter is non-null. Any other path reaching the exit normally
/// disqualifies the method.
fn guarded_parameters(graph: &MethodGraph<'_>, slots: &[usize]) -> Option<BTreeSet<usize>> {
    let mut parameters = BTreeSet::new();
    let mut visited = vec![false; graph.block_count()];
    let mut stack = vec![graph.entry()];
    visited[graph.entry().index()] = true;

    while let Some(block_id) = stack.pop() {
        let block = graph.block(block_id);
        for edge in graph.outgoing(block_id) {
            if edge.to == graph.exit()
                && edge.kind != EdgeKind::UnhandledException
                && !block.ends_in_throw()
            {
                return None;
            }
            if let Some(parameter) = checked_parameter(block.last(), block.penultimate(), slots) {
                let non_null_edge = match block.last() {
                    Some(InstructionKind::IfNull) => edge.kind == EdgeKind::FallThrough,
                    _ => edge.kind == EdgeKind::Branch,
                };
                if non_null_edge {
                    continue;
                }
                parameters.insert(parameter);
            }
            if !visited[edge.to.index()] {
                visited[edge.to.index()] = true;
                stack.push(edge.to);
            }
        }
    }
    Some(parameters)
}

/// Parameter index tested by a trailing `load p; ifnull/ifnonnull`.
fn checked_parameter(
    last: Option<&InstructionKind>,
    penultimate: Option<&InstructionKind>,
    slots: &[usize],
) -> Option<usize> {
    if !last.is_some_and(InstructionKind::is_null_test) {
        return None;
    }
    let Some(InstructionKind::Load { slot }) = penultimate else {
        return None;
    };
    slots.iter().position(|candidate| candidate == slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::CallKind;
    use crate::test_harness::{CfgBuilder, class, instance_method, op, static_method};

    fn summarize(method: Method) -> Option<MethodSummary> {
        let class = class("com/example/Checks", vec![method.clone()]);
        summarize_method(&class, &method).expect("summary")
    }

    fn throw_block() -> Vec<InstructionKind> {
        vec![
            op::new("java/lang/IllegalArgumentException"),
            op::dup(),
            op::invoke(
                CallKind::Special,
                "java/lang/IllegalArgumentException",
                "<init>",
                "()V",
            ),
            op::throw(),
        ]
    }

    #[test]
    fn method_throwing_on_every_path_always_throws() {
        let cfg = CfgBuilder::new()
            .block(throw_block())
            .exit()
            .edge(0, 1, EdgeKind::UnhandledException)
            .build();

        let summary = summarize(static_method("fail", "()V", cfg));

        assert_eq!(summary, Some(MethodSummary::AlwaysThrows));
    }

    #[test]
    fn method_with_normal_return_is_not_a_thrower() {
        let cfg = CfgBuilder::new()
            .block(vec![op::const_int(), op::if_eq()])
            .block(throw_block())
            .block(vec![op::ret()])
            .exit()
            .edge(0, 1, EdgeKind::FallThrough)
            .edge(0, 2, EdgeKind::Branch)
            .edge(1, 3, EdgeKind::UnhandledException)
            .edge(2, 3, EdgeKind::FallThrough)
            .build();

        let summary = summarize(static_method("maybe", "()V", cfg));

        assert_eq!(summary, Some(MethodSummary::None));
    }

    #[test]
    fn null_guard_clause_yields_conditional_summary() {
        // if (p == null) throw new IllegalArgumentException(); use(p); return;
        let cfg = CfgBuilder::new()
            .block(vec![op::load(0), op::if_non_null()])
            .block(throw_block())
            .block(vec![
                op::load(0),
                op::invoke_static("com/example/Checks", "use", "(Ljava/lang/Object;)V"),
                op::ret(),
            ])
            .exit()
            .edge(0, 1, EdgeKind::FallThrough)
            .edge(0, 2, EdgeKind::Branch)
            .edge(1, 3, EdgeKind::UnhandledException)
            .edge(2, 3, EdgeKind::FallThrough)
            .build();

        let summary = summarize(static_method("check", "(Ljava/lang/Object;)V", cfg));

        assert_eq!(
            summary,
            Some(MethodSummary::Conditional(BTreeSet::from([0])))
        );
    }

    #[test]
    fn parameter_index_skips_receiver_and_wide_slots() {
        // ifnull on the second parameter of an instance method taking (long, Object).
        let cfg = CfgBuilder::new()
            .block(vec![op::load(3), op::if_null()])
            .block(vec![op::ret()])
            .block(throw_block())
            .exit()
            .edge(0, 1, EdgeKind::FallThrough)
            .edge(0, 2, EdgeKind::Branch)
            .edge(1, 3, EdgeKind::FallThrough)
            .edge(2, 3, EdgeKind::UnhandledException)
            .build();

        let summary = summarize(instance_method("check", "(JLjava/lang/Object;)V", cfg));

        assert_eq!(
            summary,
            Some(MethodSummary::Conditional(BTreeSet::from([1])))
        );
    }

    #[test]
    fn null_path_returning_normally_is_not_conditional() {
        let cfg = CfgBuilder::new()
            .block(vec![op::load(0), op::if_non_null()])
            .block(vec![op::ret()])
            .block(vec![op::ret()])
            .exit()
            .edge(0, 1, EdgeKind::FallThrough)
            .edge(0, 2, EdgeKind::Branch)
            .edge(1, 3, EdgeKind::FallThrough)
            .edge(2, 3, EdgeKind::FallThrough)
            .build();

        let summary = summarize(static_method("lenient", "(Ljava/lang/Object;)V", cfg));

        assert_eq!(summary, Some(MethodSummary::None));
    }

    #[test]
    fn private_instance_methods_are_not_summarized() {
        let cfg = CfgBuilder::new()
            .block(throw_block())
            .exit()
            .edge(0, 1, EdgeKind::UnhandledException)
            .build();
        let mut method = instance_method("fail", "()V", cfg);
        method.access.is_public = false;

        assert_eq!(summarize(method), None);
    }

    #[test]
    fn library_classes_are_not_summarized() {
        let cfg = CfgBuilder::new()
            .block(throw_block())
            .exit()
            .edge(0, 1, EdgeKind::UnhandledException)
            .build();
        let method = static_method("fail", "()V", cfg);
        let mut library = class("java/util/Objects", vec![method.clone()]);
        library.is_application = false;

        assert_eq!(summarize_method(&library, &method).expect("summary"), None);
    }
}
