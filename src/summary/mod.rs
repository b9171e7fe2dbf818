pub(crate) mod store;
pub(crate) mod thrower;

pub(crate) use store::{MethodSummary, SummaryStore, SummaryStoreBuilder};
