// Rule pipeline evaluation
//
// Rules run in priority order with short-circuit on terminate. A cookie no
// rule claims falls through to the enrichment loaders; a cookie nothing can
// enrich is classified unknown.

use cookiemonster_core::{
    Context, Cookie, Enrichment, EnrichmentLoader, Notification, Rule,
};
use serde_json::json;

/// What the pipeline decided to do with a cookie.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// At least one rule matched: deliver these and complete.
    Notify(Vec<Notification>),
    /// No rule matched but a loader can add more metadata.
    Enrich(Enrichment),
    /// No rule matched and no loader can help.
    Unknown,
}

pub(crate) fn evaluate(
    cookie: &Cookie,
    rules: &[Rule],
    loaders: &[EnrichmentLoader],
    ctx: &Context,
) -> anyhow::Result<Outcome> {
    let mut notifications: Vec<Notification> = Vec::new();
    let mut terminate = false;

    for rule in rules {
        if terminate {
            break;
        }
        if rule.matches(cookie, ctx)? {
            let action = rule.generate_action(cookie, ctx)?;
            for notification in action.notifications {
                if !notifications.contains(&notification) {
                    notifications.push(notification);
                }
            }
            terminate = action.terminate;
        }
    }

    if terminate || !notifications.is_empty() {
        return Ok(Outcome::Notify(notifications));
    }

    for loader in loaders {
        if loader.can_enrich(cookie, ctx)? {
            return Ok(Outcome::Enrich(loader.load(cookie, ctx)?));
        }
    }
    Ok(Outcome::Unknown)
}

/// The notification emitted when a cookie cannot be classified.
pub(crate) fn unknown_notification(cookie: &Cookie) -> Notification {
    Notification::new("unknown", "processor", json!(cookie.identifier))
}
