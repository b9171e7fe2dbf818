pub(crate) mod decision;
pub(crate) mod driver;
pub(crate) mod frame;
