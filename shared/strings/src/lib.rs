//! String building and splitting helpers shared across the switch.
//!
//! `DynStr` is the multi-part string accumulator: callers compose output with
//! repeated writes and check the truncation latch once at the end instead of
//! checking every call.

mod dynstr;
mod slice;
mod split;

pub use dynstr::DynStr;
pub use slice::slice_str;
pub use split::split_args;
