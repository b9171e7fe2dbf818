pub(crate) mod analysis;
pub(crate) mod assertions;
pub(crate) mod checked_calls;
pub(crate) mod modeling;
pub(crate) mod value;

pub(crate) use analysis::{NullnessContext, NullnessDataflow, analyze_method};
pub(crate) use assertions::AssertionRecognizer;
pub(crate) use modeling::Interprocedural;
pub(crate) use value::IsNullValue;
