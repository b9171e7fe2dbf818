use serde::Serialize;

use crate::dataflow::frame::{Frame, FrameValue};

/// Nullness of one reference value.
///
/// Ordering (lower is more precise):
/// `Top < NonNullProven < NonNullGuarded < NonNullSilent < NullOnSimplePath < NullOnSomePath`
/// and `Top < DefinitelyNull < NullOnSomePath`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum IsNullValue {
    /// No information yet; the identity of `join`.
    Top,
    DefinitelyNull,
    /// Null on at least one incoming path, non-null on another.
    NullOnSomePath,
    /// From a nullable-annotated source that was not checked yet.
    NullOnSimplePath,
    /// Allocation, constant or `@NonNull` source. Redundant checks are reportable.
    NonNullProven,
    /// Assumed non-null without a deliberate check. Never reported.
    NonNullSilent,
    /// Would already have thrown if it were null.
    NonNullGuarded,
}

/// Longest strictly ascending chain of `IsNullValue`.
pub(crate) const LATTICE_HEIGHT: usize = 5;

pub(crate) type IsNullValueFrame = Frame<IsNullValue>;

impl IsNullValue {
    pub(crate) fn is_top(self) -> bool {
        self == Self::Top
    }

    pub(crate) fn is_definitely_null(self) -> bool {
        self == Self::DefinitelyNull
    }

    pub(crate) fn is_null_on_some_path(self) -> bool {
        self == Self::NullOnSomePath
    }

    /// Proven or guarded; silent values do not count.
    pub(crate) fn is_definitely_not_null(self) -> bool {
        matches!(self, Self::NonNullProven | Self::NonNullGuarded)
    }

    pub(crate) fn may_be_null(self) -> bool {
        matches!(
            self,
            Self::DefinitelyNull | Self::NullOnSomePath | Self::NullOnSimplePath
        )
    }

    /// Position on the non-null chain; `None` for the null values and `Top`.
    fn chain_rank(self) -> Option<u8> {
        match self {
            Self::NonNullProven => Some(1),
            Self::NonNullGuarded => Some(2),
            Self::NonNullSilent => Some(3),
            Self::NullOnSimplePath => Some(4),
            Self::Top | Self::DefinitelyNull | Self::NullOnSomePath => None,
        }
    }
}

impl FrameValue for IsNullValue {
    fn top() -> Self {
        Self::Top
    }

    fn join(&self, other: &Self) -> Self {
        match (*self, *other) {
            (Self::Top, value) | (value, Self::Top) => value,
            (left, right) if left == right => left,
            (Self::DefinitelyNull | Self::NullOnSomePath, _)
            | (_, Self::DefinitelyNull | Self::NullOnSomePath) => Self::NullOnSomePath,
            (left, right) => {
                if left.chain_rank() >= right.chain_rank() {
                    left
                } else {
                    right
                }
            }
        }
    }
}
