// cookiemonster-core - Shared data model and contracts
//
// Everything the other crates agree on lives here: the update/enrichment/
// cookie models, the CookieJar contract, the registrable plug-in types and
// the listener machinery. No I/O happens in this crate.

mod context;
mod jar;
mod listenable;
mod merge;
mod models;
mod registrable;

pub use context::Context;
pub use jar::{CookieJar, JarError, QueueChangeListener};
pub use listenable::Listenable;
pub use merge::{merge_updates, most_recent, updates_for_target};
pub use models::{Cookie, Enrichment, Metadata, Notification, Update};
pub use registrable::{
    EnrichmentLoader, NotificationReceiver, Registrable, Rule, RuleAction,
};
