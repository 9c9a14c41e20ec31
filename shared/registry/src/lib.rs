//! Keyed registries of shared, reference-counted objects.
//!
//! Every long-lived lookup table in the switch (channel techs, applications,
//! dialplan contexts, CDR back-ends, modules, variable stores) is a
//! [`Registry`]. An entry owns one strong reference to its object; `find`
//! hands the caller another one, so entries can be removed from the registry
//! while the object is still in use elsewhere.

mod hash;
mod registry;

pub use hash::hash_str;
pub use registry::{EntryId, Registry};
