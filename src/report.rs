use serde::Serialize;

use crate::callgraph::MethodId;
use crate::dataflow::frame::Validity;
use crate::ir::Location;
use crate::nullness::value::IsNullValueFrame;
use crate::nullness::{IsNullValue, NullnessDataflow};
use crate::summary::{MethodSummary, SummaryStore};

/// JSON document written by the command line.
#[derive(Debug, Serialize)]
pub(crate) struct SessionReport {
    pub(crate) summaries: Vec<SummaryEntry>,
    pub(crate) methods: Vec<MethodReport>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SummaryEntry {
    pub(crate) method: MethodId,
    pub(crate) summary: MethodSummary,
}

/// Outcome of analysing one method body.
#[derive(Debug, Serialize)]
pub(crate) struct MethodReport {
    pub(crate) method: MethodId,
    #[serde(flatten)]
    pub(crate) status: MethodStatus,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum MethodStatus {
    Ok {
        passes: usize,
        locations: Vec<LocationReport>,
    },
    Failed {
        /// Error chain, outermost context first.
        errors: Vec<String>,
    },
}

#[derive(Debug, Serialize)]
pub(crate) struct LocationReport {
    pub(crate) block: usize,
    pub(crate) index: usize,
    pub(crate) offset: u32,
    pub(crate) before: FrameReport,
    pub(crate) after: FrameReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) new_null_slot: Option<usize>,
}

#[derive(Debug, Eq, PartialEq, Serialize)]
pub(crate) struct FrameReport {
    pub(crate) validity: Validity,
    pub(crate) locals: Vec<IsNullValue>,
    pub(crate) stack: Vec<IsNullValue>,
}

impl SummaryEntry {
    pub(crate) fn collect(store: &SummaryStore) -> Vec<Self> {
        store
            .iter()
            .map(|(method, summary)| Self {
                method: method.clone(),
                summary: summary.clone(),
            })
            .collect()
    }
}

impl MethodStatus {
    /// Per-location frames of a converged dataflow, in block order.
    pub(crate) fn from_dataflow(dataflow: &NullnessDataflow<'_>) -> Self {
        let graph = dataflow.graph();
        let mut locations = Vec::new();
        for block in &graph.cfg().blocks {
            let facts = dataflow.block_facts(block.id);
            for (index, instruction) in block.instructions.iter().enumerate() {
                let location = Location::new(block.id, index);
                let (Some(before), Some(after)) = (facts.get(index), facts.get(index + 1)) else {
                    continue;
                };
                locations.push(LocationReport {
                    block: block.id.index(),
                    index,
                    offset: instruction.offset,
                    before: FrameReport::from(before),
                    after: FrameReport::from(after),
                    new_null_slot: dataflow.new_null_slot(location),
                });
            }
        }
        Self::Ok {
            passes: dataflow.passes(),
            locations,
        }
    }

    pub(crate) fn failed(error: &anyhow::Error) -> Self {
        Self::Failed {
            errors: error.chain().map(|cause| cause.to_string()).collect(),
        }
    }
}

impl From<&IsNullValueFrame> for FrameReport {
    fn from(frame: &IsNullValueFrame) -> Self {
        Self {
            validity: frame.validity(),
            locals: frame.locals().to_vec(),
            stack: frame.stack().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::frame::Frame;

    #[test]
    fn failed_status_keeps_error_chain() {
        let error = anyhow::anyhow!("stack underflow").context("nullness dataflow");

        let MethodStatus::Failed { errors } = MethodStatus::failed(&error) else {
            panic!("expected failure");
        };

        assert_eq!(errors, vec!["nullness dataflow", "stack underflow"]);
    }

    #[test]
    fn frame_report_serializes_values_in_snake_case() {
        let mut frame = Frame::new(1, 1);
        frame.set_valid();
        frame.set_local(0, IsNullValue::NonNullProven).expect("local");
        frame.push(IsNullValue::DefinitelyNull).expect("push");

        let json = serde_json::to_value(FrameReport::from(&frame)).expect("json");

        assert_eq!(
            json,
            serde_json::json!({
                "validity": "valid",
                "locals": ["non_null_proven"],
                "stack": ["definitely_null"],
            })
        );
    }

    #[test]
    fn top_frame_reports_empty_stack() {
        let frame: IsNullValueFrame = Frame::new(2, 1);

        let report = FrameReport::from(&frame);

        assert_eq!(report.validity, Validity::Top);
        assert!(report.stack.is_empty());
    }
}
