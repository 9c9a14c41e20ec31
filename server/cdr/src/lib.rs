//! Call detail records.
//!
//! Every channel carries one [`Cdr`]; transferred or forked legs chain onto
//! it. On hangup the record is detached to the engine's poster task, which
//! batches submissions and fans each batch out to the registered back-ends —
//! slow back-ends never block call paths, and every back-end sees every
//! record exactly once, in submission order.

mod engine;
mod record;

pub use engine::{CdrBackend, CdrEngine};
pub use record::{
    causes, AmaFlags, CallSnapshot, Cdr, CdrError, CdrView, Disposition, ResetFlags,
};
