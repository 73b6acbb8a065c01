//! Binary-side helpers.

pub(crate) mod progress_manager;
