use thiserror::Error;

pub type PbxResult<T> = Result<T, PbxError>;

#[derive(Error, Debug)]
pub enum PbxError {
    #[error("no such context: {0}")]
    NoContext(String),

    #[error("no such extension '{exten}' in context '{context}'")]
    NoExtension { context: String, exten: String },

    #[error("no such priority {priority} in extension '{exten}' in context '{context}'")]
    NoPriority {
        context: String,
        exten: String,
        priority: i32,
    },

    #[error("no such label '{label}' in extension '{exten}' in context '{context}'")]
    NoLabel {
        context: String,
        exten: String,
        label: String,
    },

    #[error("no such application: {0}")]
    NoApp(String),

    #[error("extension '{exten}' priority {priority} already exists in '{context}'")]
    ExtensionExists {
        context: String,
        exten: String,
        priority: i32,
    },

    #[error("already included: {0}")]
    AlreadyIncluded(String),

    #[error("include stack overflow")]
    StackOverflow,
}

/// Lookup outcome detail, ordered worst to best; search keeps the best seen
/// so the executor can pick the right fallback (`i`, `t`, autofallthrough).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LookupStatus {
    NoContext,
    NoExtension,
    NoPriority,
    NoLabel,
    Success,
}
