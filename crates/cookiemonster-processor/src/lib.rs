// cookiemonster-processor - The rule pipeline worker pool
//
// A bounded pool of fungible workers drains the cookie jar whenever its
// queue changes. Each cookie runs through the rule pipeline against a
// per-cookie registry snapshot and either completes (with notifications),
// goes back for another round after enrichment, or is marked failed.

mod pipeline;
mod pool;

pub use pool::{ProcessorPool, ProcessorPoolConfig};
