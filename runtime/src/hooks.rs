use std::sync::Arc;

use async_trait::async_trait;
use nanobot_mcp_core::{Direction, HookDefinition, Message};

use crate::error::{Error, Result};
use crate::session::Session;

pub enum HookOutcome {
    Continue,
    Rewrite(Message),
    Reject(String),
}

/// Interceptor for messages entering or leaving a session.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, session: &Session, event: &HookDefinition, msg: &Message) -> Result<HookOutcome>;
}

#[derive(Clone)]
struct Registration {
    filter: HookDefinition,
    hook: Arc<dyn Hook>,
}

/// Ordered list of hooks; each runs when its filter matches the message event.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Registration>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `hook` under a selector such as `message:tools/call?direction=out`.
    pub fn register(&mut self, selector: &str, hook: Arc<dyn Hook>) -> Result<()> {
        let filter: HookDefinition = selector.parse()?;
        self.hooks.push(Registration { filter, hook });
        Ok(())
    }

    pub fn with(mut self, selector: &str, hook: Arc<dyn Hook>) -> Result<Self> {
        self.register(selector, hook)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn run(&self, session: &Session, direction: Direction, mut msg: Message) -> Result<Message> {
        if self.hooks.is_empty() {
            return Ok(msg);
        }
        let event = HookDefinition::event(
            msg.method.clone(),
            session.name(),
            direction,
            msg.error.is_some(),
        );
        for reg in self.hooks.iter().filter(|r| r.filter.matches(&event)) {
            match reg.hook.run(session, &event, &msg).await? {
                HookOutcome::Continue => {}
                HookOutcome::Rewrite(next) => msg = next,
                HookOutcome::Reject(reason) => {
                    tracing::info!(
                        target = "hooks",
                        hook = %reg.filter,
                        method = %event.method,
                        direction = %direction,
                        reason = %reason,
                        "message_rejected"
                    );
                    return Err(Error::HookRejected {
                        hook: reg.filter.to_string(),
                        reason,
                    });
                }
            }
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Count(AtomicUsize);

    #[async_trait]
    impl Hook for Count {
        async fn run(&self, _s: &Session, _e: &HookDefinition, _m: &Message) -> Result<HookOutcome> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(HookOutcome::Continue)
        }
    }

    struct Tag(&'static str);

    #[async_trait]
    impl Hook for Tag {
        async fn run(&self, _s: &Session, _e: &HookDefinition, m: &Message) -> Result<HookOutcome> {
            let mut next = m.clone();
            let mut tags = next
                .params
                .as_ref()
                .and_then(|p| p.get("tags"))
                .cloned()
                .unwrap_or_else(|| json!([]));
            if let Some(arr) = tags.as_array_mut() {
                arr.push(json!(self.0));
            }
            next.params = Some(json!({ "tags": tags }));
            Ok(HookOutcome::Rewrite(next))
        }
    }

    struct Deny;

    #[async_trait]
    impl Hook for Deny {
        async fn run(&self, _s: &Session, _e: &HookDefinition, _m: &Message) -> Result<HookOutcome> {
            Ok(HookOutcome::Reject("not allowed".into()))
        }
    }

    #[tokio::test]
    async fn rewrites_flow_through_the_chain_in_order() {
        let session = Session::empty("fs");
        let chain = HookChain::new()
            .with("message:tools/call", Arc::new(Tag("a")))
            .unwrap()
            .with("message:*?direction=out", Arc::new(Tag("b")))
            .unwrap();
        let out = chain
            .run(&session, Direction::Out, Message::request(1, "tools/call", None))
            .await
            .unwrap();
        assert_eq!(out.params, Some(json!({"tags":["a","b"]})));
    }

    #[tokio::test]
    async fn rejection_names_the_hook() {
        let session = Session::empty("fs");
        let counter = Arc::new(Count(AtomicUsize::new(0)));
        let chain = HookChain::new()
            .with("message:tools/call?name=fs", Arc::new(Deny))
            .unwrap()
            .with("message:", counter.clone())
            .unwrap();
        let err = chain
            .run(&session, Direction::Out, Message::request(1, "tools/call", None))
            .await
            .err()
            .unwrap();
        match err {
            Error::HookRejected { hook, reason } => {
                assert_eq!(hook, "message:tools/call?name=fs");
                assert_eq!(reason, "not allowed");
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_matching_hooks_are_skipped() {
        let session = Session::empty("fs");
        let counter = Arc::new(Count(AtomicUsize::new(0)));
        let chain = HookChain::new()
            .with("message:tools/list?direction=in", counter.clone())
            .unwrap();
        chain
            .run(&session, Direction::Out, Message::request(1, "tools/list", None))
            .await
            .unwrap();
        chain
            .run(&session, Direction::In, Message::request(2, "tools/list", None))
            .await
            .unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn malformed_selector_fails_registration() {
        let mut chain = HookChain::new();
        assert!(matches!(
            chain.register("tools/call", Arc::new(Deny)),
            Err(Error::InvalidHook(_))
        ));
        assert!(chain.is_empty());
    }
}
