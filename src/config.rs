use std::collections::BTreeSet;

use clap::Args;

/// Named options controlling the nullness analysis.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct AnalysisConfig {
    /// Reset null values to non-reporting non-null after assertion calls.
    pub(crate) suppress_assertion_nulls: bool,
    /// Use congruence classes for known values, parameter facts and loads.
    pub(crate) track_value_numbers: bool,
    /// Derive reference return values from annotations of call targets.
    pub(crate) model_return_values: bool,
    /// Treat successfully dereferenced values as non-null afterwards.
    pub(crate) model_dereferences: bool,
    /// Trust call results that were compared against null earlier.
    pub(crate) track_checked_calls: bool,
    /// Extra assertion methods as `owner.name`, e.g. `com/acme/Check.that`.
    pub(crate) assertion_methods: BTreeSet<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            suppress_assertion_nulls: true,
            track_value_numbers: true,
            model_return_values: true,
            model_dereferences: true,
            track_checked_calls: true,
            assertion_methods: BTreeSet::new(),
        }
    }
}

/// Command-line switches mapped onto `AnalysisConfig`.
#[derive(Args, Clone, Debug, Default)]
pub(crate) struct AnalysisArgs {
    /// Keep null values alive across assertion calls.
    #[arg(long)]
    no_assertion_suppression: bool,
    /// Disable congruence-based refinements.
    #[arg(long)]
    no_value_numbers: bool,
    /// Treat every reference return value as non-reporting non-null.
    #[arg(long)]
    no_return_modeling: bool,
    /// Do not tighten values after they are dereferenced.
    #[arg(long)]
    no_dereference_modeling: bool,
    /// Ignore earlier null checks of call results.
    #[arg(long)]
    no_checked_calls: bool,
    /// Additional assertion method, as `owner.name`.
    #[arg(long = "assertion-method", value_name = "OWNER.NAME")]
    assertion_methods: Vec<String>,
}

impl From<&AnalysisArgs> for AnalysisConfig {
    fn from(args: &AnalysisArgs) -> Self {
        Self {
            suppress_assertion_nulls: !args.no_assertion_suppression,
            track_value_numbers: !args.no_value_numbers,
            model_return_values: !args.no_return_modeling,
            model_dereferences: !args.no_dereference_modeling,
            track_checked_calls: !args.no_checked_calls,
            assertion_methods: args.assertion_methods.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_args_enable_everything() {
        assert_eq!(AnalysisConfig::from(&AnalysisArgs::default()), AnalysisConfig::default());
    }

    #[test]
    fn switches_disable_options() {
        let args = AnalysisArgs {
            no_value_numbers: true,
            no_checked_calls: true,
            assertion_methods: vec!["com/acme/Check.that".to_string()],
            ..AnalysisArgs::default()
        };

        let config = AnalysisConfig::from(&args);

        assert!(!config.track_value_numbers);
        assert!(!config.track_checked_calls);
        assert!(config.suppress_assertion_nulls);
        assert!(config.assertion_methods.contains("com/acme/Check.that"));
    }
}
