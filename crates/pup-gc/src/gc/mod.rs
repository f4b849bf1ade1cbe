//! Tracing, copying and sweeping.

pub(crate) mod collector;
pub(crate) mod copy;
pub mod refqueue;
pub(crate) mod state;
pub(crate) mod sweep;
pub(crate) mod tracer;
