#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::similar_names)]
#![allow(clippy::wildcard_imports)]

pub mod acl;
pub mod cache;
pub mod events;
pub mod forwarder;
pub mod net;
pub mod resolver;
pub mod settings;
pub mod upstream;

/// Abort message for lock poisoning.  The shared structures are only
/// locked for short, panic-free critical sections, so a poisoned lock
/// means a bug this process cannot recover from.
pub(crate) const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] mutex poisoned, cannot recover from this - aborting";
