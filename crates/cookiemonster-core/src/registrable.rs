// Registrable plug-in types
//
// Rules, enrichment loaders and notification receivers are plain data plus
// function pointers. Registries order them by descending priority, ties
// broken by stable id, and hand out immutable snapshots.

use std::sync::Arc;

use anyhow::Result;

use crate::context::Context;
use crate::models::{Cookie, Enrichment, Notification};

/// Anything a registry can hold: stable identity plus a priority.
pub trait Registrable: Clone + Send + Sync + 'static {
    fn stable_id(&self) -> &str;
    fn priority(&self) -> i32;
}

/// The outcome of a matched rule.
#[derive(Debug, Clone)]
pub struct RuleAction {
    pub notifications: Vec<Notification>,
    pub terminate: bool,
}

impl RuleAction {
    pub fn new(notifications: Vec<Notification>, terminate: bool) -> Self {
        Self {
            notifications,
            terminate,
        }
    }
}

type MatchFn = dyn Fn(&Cookie, &Context) -> Result<bool> + Send + Sync;
type ActionFn = dyn Fn(&Cookie, &Context) -> Result<RuleAction> + Send + Sync;

/// A rule: a matching criterion and the action generated on a match.
#[derive(Clone)]
pub struct Rule {
    id: String,
    priority: i32,
    matches: Arc<MatchFn>,
    generate_action: Arc<ActionFn>,
}

impl Rule {
    pub fn new<M, G>(id: impl Into<String>, priority: i32, matches: M, generate_action: G) -> Self
    where
        M: Fn(&Cookie, &Context) -> Result<bool> + Send + Sync + 'static,
        G: Fn(&Cookie, &Context) -> Result<RuleAction> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            priority,
            matches: Arc::new(matches),
            generate_action: Arc::new(generate_action),
        }
    }

    pub fn matches(&self, cookie: &Cookie, ctx: &Context) -> Result<bool> {
        (self.matches)(cookie, ctx)
    }

    pub fn generate_action(&self, cookie: &Cookie, ctx: &Context) -> Result<RuleAction> {
        (self.generate_action)(cookie, ctx)
    }
}

impl Registrable for Rule {
    fn stable_id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

type CanEnrichFn = dyn Fn(&Cookie, &Context) -> Result<bool> + Send + Sync;
type LoadFn = dyn Fn(&Cookie, &Context) -> Result<Enrichment> + Send + Sync;

/// Loads data that can enrich a cookie with more information.
#[derive(Clone)]
pub struct EnrichmentLoader {
    id: String,
    priority: i32,
    can_enrich: Arc<CanEnrichFn>,
    load: Arc<LoadFn>,
}

impl EnrichmentLoader {
    pub fn new<C, L>(id: impl Into<String>, priority: i32, can_enrich: C, load: L) -> Self
    where
        C: Fn(&Cookie, &Context) -> Result<bool> + Send + Sync + 'static,
        L: Fn(&Cookie, &Context) -> Result<Enrichment> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            priority,
            can_enrich: Arc::new(can_enrich),
            load: Arc::new(load),
        }
    }

    pub fn can_enrich(&self, cookie: &Cookie, ctx: &Context) -> Result<bool> {
        (self.can_enrich)(cookie, ctx)
    }

    pub fn load(&self, cookie: &Cookie, ctx: &Context) -> Result<Enrichment> {
        (self.load)(cookie, ctx)
    }
}

impl Registrable for EnrichmentLoader {
    fn stable_id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

impl std::fmt::Debug for EnrichmentLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentLoader")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

type ReceiveFn = dyn Fn(&Notification, &Context) -> Result<()> + Send + Sync;

/// A downstream consumer of notifications. Every receiver sees every
/// notification; filtering is the receiver's responsibility.
#[derive(Clone)]
pub struct NotificationReceiver {
    id: String,
    priority: i32,
    receive: Arc<ReceiveFn>,
}

impl NotificationReceiver {
    pub fn new<R>(id: impl Into<String>, receive: R) -> Self
    where
        R: Fn(&Notification, &Context) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            priority: 0,
            receive: Arc::new(receive),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn receive(&self, notification: &Notification, ctx: &Context) -> Result<()> {
        (self.receive)(notification, ctx)
    }

    /// A receiver that emits every notification as a tracing record.
    pub fn tracing_receiver() -> Self {
        Self::new("tracing", |notification, _ctx| {
            tracing::info!(
                about = %notification.about,
                sender = %notification.sender,
                data = %notification.data,
                "notification"
            );
            Ok(())
        })
    }
}

impl Registrable for NotificationReceiver {
    fn stable_id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

impl std::fmt::Debug for NotificationReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationReceiver")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Default for RuleAction {
    fn default() -> Self {
        Self {
            notifications: Vec::new(),
            terminate: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jar::{CookieJar, JarError, QueueChangeListener};
    use crate::models::Metadata;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    struct NullJar;

    #[async_trait]
    impl CookieJar for NullJar {
        async fn fetch_cookie(&self, _: &str) -> Result<Option<Cookie>, JarError> {
            Ok(None)
        }
        async fn delete_cookie(&self, _: &str) -> Result<(), JarError> {
            Ok(())
        }
        async fn enrich_cookie(&self, _: &str, _: Enrichment) -> Result<(), JarError> {
            Ok(())
        }
        async fn mark_as_failed(&self, _: &str, _: Duration) -> Result<(), JarError> {
            Ok(())
        }
        async fn mark_as_complete(&self, _: &str) -> Result<(), JarError> {
            Ok(())
        }
        async fn mark_for_processing(&self, _: &str) -> Result<(), JarError> {
            Ok(())
        }
        async fn get_next_for_processing(&self) -> Result<Option<Cookie>, JarError> {
            Ok(None)
        }
        async fn queue_length(&self) -> Result<usize, JarError> {
            Ok(0)
        }
        fn add_listener(&self, _: QueueChangeListener) {}
    }

    fn ctx() -> Context {
        Context::new(Arc::new(NullJar)).with_value("zone", json!("seq"))
    }

    #[test]
    fn rule_invokes_closures() {
        let rule = Rule::new(
            "match-all",
            5,
            |_cookie, _ctx| Ok(true),
            |cookie, _ctx| {
                Ok(RuleAction::new(
                    vec![Notification::new("matched", "match-all", json!(cookie.identifier))],
                    true,
                ))
            },
        );

        let cookie = Cookie::new("/data/a");
        let ctx = ctx();
        assert!(rule.matches(&cookie, &ctx).unwrap());
        let action = rule.generate_action(&cookie, &ctx).unwrap();
        assert!(action.terminate);
        assert_eq!(action.notifications.len(), 1);
    }

    #[test]
    fn loader_reads_context_values() {
        let loader = EnrichmentLoader::new(
            "zone-loader",
            1,
            |_cookie, ctx| Ok(ctx.value("zone").is_some()),
            |_cookie, ctx| {
                let mut metadata = Metadata::new();
                metadata.insert("zone".to_string(), ctx.value("zone").cloned().unwrap());
                Ok(Enrichment::new("zone-loader", Utc::now(), metadata))
            },
        );

        let cookie = Cookie::new("/data/a");
        let ctx = ctx();
        assert!(loader.can_enrich(&cookie, &ctx).unwrap());
        let enrichment = loader.load(&cookie, &ctx).unwrap();
        assert_eq!(enrichment.metadata["zone"], json!("seq"));
    }
}
