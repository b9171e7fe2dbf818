use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::annotations::ProgramAnnotations;
use crate::callgraph::{ClassHierarchy, MethodId};
use crate::config::AnalysisConfig;
use crate::ir::{Class, Method, Program};
use crate::nullness::{AssertionRecognizer, Interprocedural, NullnessContext, analyze_method};
use crate::report::{MethodReport, MethodStatus, SessionReport, SummaryEntry};
use crate::summary::thrower::summarize_method;
use crate::summary::{SummaryStore, SummaryStoreBuilder};
use crate::telemetry::{self, Phase, Telemetry};

/// One analysis run over a program: thrower summaries first, then nullness.
pub(crate) struct AnalysisSession<'p> {
    program: &'p Program,
    config: AnalysisConfig,
    hierarchy: ClassHierarchy,
    assertions: AssertionRecognizer,
    telemetry: Option<&'p Telemetry>,
}

impl<'p> AnalysisSession<'p> {
    pub(crate) fn new(
        program: &'p Program,
        config: AnalysisConfig,
        telemetry: Option<&'p Telemetry>,
    ) -> Self {
        let assertions = AssertionRecognizer::new(&config.assertion_methods);
        Self {
            program,
            hierarchy: ClassHierarchy::new(&program.classes),
            config,
            assertions,
            telemetry,
        }
    }

    pub(crate) fn run(&self) -> Result<SessionReport> {
        let summaries =
            telemetry::phase(self.telemetry, Phase::Summaries, || self.build_summaries())?;
        info!("session: summaries={} event=summaries_frozen", summaries.len());
        let methods = telemetry::phase(self.telemetry, Phase::Nullness, || {
            self.analyze_methods(&summaries)
        });
        let failed = methods
            .iter()
            .filter(|report| matches!(report.status, MethodStatus::Failed { .. }))
            .count();
        info!(
            "session: methods={} failed={} event=nullness_done",
            methods.len(),
            failed
        );
        Ok(SessionReport {
            summaries: SummaryEntry::collect(&summaries),
            methods,
        })
    }

    /// Summarize every eligible method; the store is frozen before it is read.
    fn build_summaries(&self) -> Result<SummaryStore> {
        let builder = SummaryStoreBuilder::new();
        self.bodies().par_iter().for_each(|(class, method)| {
            let id = MethodId::new(&class.name, &method.name, &method.descriptor);
            let summary = match summarize_method(class, method) {
                Ok(Some(summary)) => summary,
                Ok(None) => return,
                Err(err) => {
                    warn!("thrower: method={} error={:#} event=skipped", id, err);
                    return;
                }
            };
            let label = id.to_string();
            if let Err(err) = builder.record(id, summary) {
                warn!("thrower: method={} error={:#} event=not_recorded", label, err);
            }
        });
        builder.freeze().context("freeze summaries")
    }

    fn analyze_methods(&self, summaries: &SummaryStore) -> Vec<MethodReport> {
        let annotations = ProgramAnnotations::new(&self.program.classes, &self.hierarchy);
        self.bodies()
            .par_iter()
            .map(|(class, method)| {
                let context = NullnessContext {
                    config: &self.config,
                    assertions: &self.assertions,
                    interprocedural: Interprocedural {
                        summaries,
                        resolver: &self.hierarchy,
                        annotations: &annotations,
                        non_null_parameters: &annotations,
                    },
                };
                let id = MethodId::new(&class.name, &method.name, &method.descriptor);
                let result = telemetry::method(self.telemetry, &id, || {
                    analyze_method(&context, class, method, |dataflow| {
                        telemetry::record_convergence(
                            dataflow.passes(),
                            dataflow.graph().block_count(),
                        );
                        MethodStatus::from_dataflow(dataflow)
                    })
                });
                let status = result.unwrap_or_else(|err| {
                    warn!("nullness: method={} error={:#} event=failed", id, err);
                    MethodStatus::failed(&err)
                });
                MethodReport { method: id, status }
            })
            .collect()
    }

    /// Methods with a body, in program order.
    fn bodies(&self) -> Vec<(&'p Class, &'p Method)> {
        self.program
            .classes
            .iter()
            .flat_map(|class| {
                class
                    .methods
                    .iter()
                    .filter(|method| method.cfg.is_some())
                    .map(move |method| (class, method))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::frame::Validity;
    use crate::ir::EdgeKind;
    use crate::nullness::IsNullValue;
    use crate::summary::MethodSummary;
    use crate::test_harness::{CfgBuilder, class, op, static_method};

    const CHECK: &str = "(Ljava/lang/Object;)V";

    fn checks_class() -> Class {
        // static void check(Object o) { if (o == null) throw new IllegalStateException(); }
        let cfg = CfgBuilder::new()
            .block(vec![op::load(0), op::if_non_null()])
            .block(vec![op::new("java/lang/IllegalStateException"), op::throw()])
            .block(vec![op::ret()])
            .exit()
            .edge(0, 1, EdgeKind::FallThrough)
            .edge(0, 2, EdgeKind::Branch)
            .edge(1, 3, EdgeKind::UnhandledException)
            .edge(2, 3, EdgeKind::FallThrough)
            .build();
        class("app/Checks", vec![static_method("check", CHECK, cfg)])
    }

    fn caller_class() -> Class {
        // static void run(Object p) { Checks.check(p); }
        let cfg = CfgBuilder::new()
            .block(vec![
                op::load(0),
                op::invoke_static("app/Checks", "check", CHECK),
                op::ret(),
            ])
            .exit()
            .edge(0, 1, EdgeKind::FallThrough)
            .build();
        class("app/Caller", vec![static_method("run", CHECK, cfg)])
    }

    fn method_report<'r>(report: &'r SessionReport, name: &str) -> &'r MethodReport {
        report
            .methods
            .iter()
            .find(|method| method.method.name == name)
            .expect("method report")
    }

    #[test]
    fn summaries_are_available_to_nullness_phase() {
        let program = Program {
            classes: vec![checks_class(), caller_class()],
        };
        let session = AnalysisSession::new(&program, AnalysisConfig::default(), None);

        let report = session.run().expect("session");

        let check = MethodId::new("app/Checks", "check", CHECK);
        let entry = report
            .summaries
            .iter()
            .find(|entry| entry.method == check)
            .expect("summary");
        assert_eq!(entry.summary, MethodSummary::Conditional([0].into()));
        assert_eq!(report.methods.len(), 2);
        let MethodStatus::Ok { locations, .. } = &method_report(&report, "run").status else {
            panic!("expected converged analysis");
        };
        let after_call = locations
            .iter()
            .find(|location| location.block == 0 && location.index == 1)
            .expect("call");
        assert_eq!(after_call.after.validity, Validity::Valid);
        assert_eq!(after_call.after.locals[0], IsNullValue::NonNullGuarded);
    }

    #[test]
    fn failing_method_does_not_abort_the_session() {
        let broken = CfgBuilder::new()
            .block(vec![op::ret()])
            .exit()
            .edge(0, 5, EdgeKind::FallThrough)
            .build();
        let program = Program {
            classes: vec![
                class("app/Broken", vec![static_method("dangling", "()V", broken)]),
                checks_class(),
                caller_class(),
            ],
        };
        let session = AnalysisSession::new(&program, AnalysisConfig::default(), None);

        let report = session.run().expect("session");

        assert!(matches!(
            method_report(&report, "dangling").status,
            MethodStatus::Failed { .. }
        ));
        assert!(matches!(
            method_report(&report, "run").status,
            MethodStatus::Ok { .. }
        ));
    }

    #[test]
    fn duplicate_method_is_summarized_once_and_session_continues() {
        let mut checks = checks_class();
        checks.methods.push(checks.methods[0].clone());
        let program = Program {
            classes: vec![checks, caller_class()],
        };
        let session = AnalysisSession::new(&program, AnalysisConfig::default(), None);

        let report = session.run().expect("session");

        let check = MethodId::new("app/Checks", "check", CHECK);
        let recorded = report
            .summaries
            .iter()
            .filter(|entry| entry.method == check)
            .count();
        assert_eq!(recorded, 1);
        assert_eq!(report.methods.len(), 3);
        assert!(matches!(
            method_report(&report, "run").status,
            MethodStatus::Ok { .. }
        ));
    }

    #[test]
    fn methods_are_reported_in_program_order() {
        let program = Program {
            classes: vec![caller_class(), checks_class()],
        };
        let session = AnalysisSession::new(&program, AnalysisConfig::default(), None);

        let report = session.run().expect("session");

        let names: Vec<&str> = report
            .methods
            .iter()
            .map(|method| method.method.name.as_str())
            .collect();
        assert_eq!(names, vec!["run", "check"]);
    }
}
