use std::collections::BTreeSet;

use crate::ir::CallSite;

const ASSERTION_CLASS_MARKERS: [&str; 4] = ["assert", "preconditions", "validate", "verify"];
const ASSERTION_METHOD_PREFIXES: [&str; 5] = ["assert", "check", "verify", "fail", "require"];

/// Recognizes calls that stop execution when their argument is invalid.
///
/// A call is an assertion when its owner's simple name looks like an
/// assertion utility and its name looks like a check, or when `owner.name` is
/// configured explicitly. Owners may be given with `/` or `.` separators.
#[derive(Clone, Debug, Default)]
pub(crate) struct AssertionRecognizer {
    configured: BTreeSet<String>,
}

impl AssertionRecognizer {
    pub(crate) fn new(configured: &BTreeSet<String>) -> Self {
        Self {
            configured: configured
                .iter()
                .map(|entry| entry.replace('.', "/"))
                .collect(),
        }
    }

    pub(crate) fn is_assertion(&self, call: &CallSite) -> bool {
        let qualified = format!("{}/{}", call.owner.replace('.', "/"), call.name);
        if self.configured.contains(&qualified) {
            return true;
        }
        let simple = call
            .owner
            .rsplit(['/', '.', '$'])
            .next()
            .unwrap_or(&call.owner)
            .to_ascii_lowercase();
        let name = call.name.to_ascii_lowercase();
        ASSERTION_CLASS_MARKERS
            .iter()
            .any(|marker| simple.contains(marker))
            && ASSERTION_METHOD_PREFIXES
                .iter()
                .any(|prefix| name.starts_with(prefix))
    }
}
