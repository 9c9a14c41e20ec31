//! Dialplan engine.
//!
//! Contexts hold pattern-matched extensions; the interpreter walks a
//! channel's (context, exten, priority) cursor, substituting variables into
//! application arguments and dispatching through the core's application
//! registry. Hints watch device state; switches delegate unmatched names to
//! pluggable resolvers.

mod builtins;
mod context;
mod engine;
mod error;
mod expr;
mod funcs;
mod hints;
mod interp;
mod pattern;
mod subst;
mod timing;
mod vars;

pub use context::{Context, ContextSet, Include, PriorityEntry, SwitchRef};
pub use engine::{DialplanEngine, EngineOptions, Switch};
pub use error::{LookupStatus, PbxError, PbxResult};
pub use expr::eval_expr;
pub use funcs::DialplanFunction;
pub use hints::{ExtState, WatcherId};
pub use interp::{async_goto_to, explicit_goto, goto_parsed, pbx_run, pbx_start};
pub use pattern::{pattern_match, MatchResult};
pub use subst::substitute;
pub use timing::TimeSpec;
pub use vars::retrieve_variable;

/// Hints live at this reserved priority and are never executed.
pub const PRIORITY_HINT: i32 = 0;

/// Depth bound for include recursion.
pub const MAX_INCLUDE_DEPTH: usize = 128;

/// Depth bound for nested `${...}` / `$[...]` substitution.
pub const MAX_SUBST_DEPTH: usize = 15;
