//! Message dispatcher.
//!
//! Per message: `Received -> Moderated? -> Dispatch -> [Rollback?] -> Delivered`.
//! Handlers run tier by tier, highest first. Awaited handlers can veto the
//! rest of the dispatch; a veto replays any compensation registered earlier
//! in the same dispatch.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::messaging::{ChatMessage, MessageSink, OutboundMessage};
use crate::metrics::{DISPATCH_OUTCOMES_TOTAL, HANDLER_FAILURES_TOTAL};
use crate::moderation::Moderation;
use crate::permission::{PermissionCache, PermissionResolver, SenderCapabilities};
use crate::template::ResponseEngine;

use super::detached::{DetachedJob, DetachedQueue, DetachedStatsSnapshot};
use super::handler::Invocation;
use super::registry::{CommandRegistry, ExecutionMode};
use super::rollback::RollbackManager;

/// Terminal state of a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    /// Sender is on the ignore list
    Ignored,
    /// Stopped by moderation filters
    Moderated,
    Delivered,
    /// An awaited handler failed and nothing needed compensating
    Vetoed,
    /// An awaited handler failed and earlier charges were restored
    RolledBack,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Moderated => "moderated",
            Self::Delivered => "delivered",
            Self::Vetoed => "vetoed",
            Self::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub id: Uuid,
    pub state: DispatchState,
    /// Responses of awaited handlers, in delivery order. Empty when the
    /// message was quiet.
    pub responses: Vec<OutboundMessage>,
}

/// Statistics for the dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub total_dispatched: AtomicU64,
    pub total_ignored: AtomicU64,
    pub total_moderated: AtomicU64,
    pub total_delivered: AtomicU64,
    pub total_vetoed: AtomicU64,
    pub total_rolled_back: AtomicU64,
    /// Awaited handlers that returned an error or panicked
    pub handler_failures: AtomicU64,
    pub responses_delivered: AtomicU64,
}

impl DispatcherStats {
    fn record(&self, state: DispatchState) {
        self.total_dispatched.fetch_add(1, Ordering::Relaxed);
        let counter = match state {
            DispatchState::Ignored => &self.total_ignored,
            DispatchState::Moderated => &self.total_moderated,
            DispatchState::Delivered => &self.total_delivered,
            DispatchState::Vetoed => &self.total_vetoed,
            DispatchState::RolledBack => &self.total_rolled_back,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        DISPATCH_OUTCOMES_TOTAL
            .with_label_values(&[state.as_str()])
            .inc();
    }

    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            total_dispatched: self.total_dispatched.load(Ordering::Relaxed),
            total_ignored: self.total_ignored.load(Ordering::Relaxed),
            total_moderated: self.total_moderated.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_vetoed: self.total_vetoed.load(Ordering::Relaxed),
            total_rolled_back: self.total_rolled_back.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            responses_delivered: self.responses_delivered.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub total_dispatched: u64,
    pub total_ignored: u64,
    pub total_moderated: u64,
    pub total_delivered: u64,
    pub total_vetoed: u64,
    pub total_rolled_back: u64,
    pub handler_failures: u64,
    pub responses_delivered: u64,
}

/// Why an awaited handler stopped the dispatch
enum Failure {
    Permission,
    Denied(Vec<OutboundMessage>),
    Error(anyhow::Error),
    Panic,
}

pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    engine: Arc<ResponseEngine>,
    permissions: Arc<PermissionResolver>,
    moderation: Arc<dyn Moderation>,
    sink: Arc<dyn MessageSink>,
    detached: DetachedQueue,
    stats: DispatcherStats,
}

impl Dispatcher {
    /// Create a dispatcher and start its detached worker. Must be called
    /// inside a Tokio runtime.
    pub fn new(
        registry: Arc<CommandRegistry>,
        engine: Arc<ResponseEngine>,
        permissions: Arc<PermissionResolver>,
        moderation: Arc<dyn Moderation>,
        sink: Arc<dyn MessageSink>,
    ) -> (Self, JoinHandle<()>) {
        let (detached, worker) = DetachedQueue::start(sink.clone());

        let dispatcher = Self {
            registry,
            engine,
            permissions,
            moderation,
            sink,
            detached,
            stats: DispatcherStats::default(),
        };

        (dispatcher, worker)
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn detached_stats(&self) -> DetachedStatsSnapshot {
        self.detached.stats()
    }

    pub fn engine(&self) -> &Arc<ResponseEngine> {
        &self.engine
    }

    /// Run one chat line through the pipeline and deliver its responses.
    #[tracing::instrument(
        name = "dispatch",
        skip_all,
        fields(sender = %message.sender.username, skip = message.skip, quiet = message.quiet)
    )]
    pub async fn dispatch(&self, message: ChatMessage) -> DispatchOutcome {
        let id = Uuid::new_v4();

        if self.moderation.is_ignored(&message.sender).await {
            tracing::debug!(dispatch_id = %id, "Sender ignored");
            return self.finish(id, DispatchState::Ignored, Vec::new());
        }

        if self.moderation.is_moderated(&message).await {
            tracing::debug!(dispatch_id = %id, "Message moderated");
            return self.finish(id, DispatchState::Moderated, Vec::new());
        }

        let cache = Arc::new(PermissionCache::for_sender(self.permissions.clone(), &message.sender).await);
        let capabilities = cache
            .capabilities(&message.sender.id)
            .unwrap_or_else(|| SenderCapabilities::viewer(&message.sender));

        let honour_skip = message.skip && capabilities.is_privileged();
        if message.skip && !honour_skip {
            tracing::debug!(dispatch_id = %id, "Ignoring skip flag from unprivileged sender");
        }

        let quiet = message.quiet;
        let message = Arc::new(message);
        let rollback = Arc::new(RollbackManager::new());
        let plan = self.registry.resolve(&message.text);

        let mut responses = Vec::new();
        let mut state = DispatchState::Delivered;

        for planned in plan {
            let registration = planned.registration;

            if honour_skip && registration.skippable {
                tracing::debug!(dispatch_id = %id, handler = %registration.name, "Handler skipped");
                continue;
            }

            let permitted = cache
                .check(&message.sender.id, registration.permission)
                .await;

            let invocation = Invocation {
                dispatch_id: id,
                message: message.clone(),
                capabilities: capabilities.clone(),
                command: planned.command,
                param: planned.param,
                engine: self.engine.clone(),
                rollback: rollback.clone(),
                permissions: cache.clone(),
            };

            if registration.mode == ExecutionMode::FireAndForget {
                if !permitted {
                    tracing::debug!(
                        dispatch_id = %id,
                        handler = %registration.name,
                        "Permission denied for detached handler"
                    );
                    continue;
                }

                // Detached handlers never join this dispatch's rollback chain
                let invocation = Invocation {
                    rollback: Arc::new(RollbackManager::new()),
                    ..invocation
                };
                self.detached.push(DetachedJob {
                    registration: registration.clone(),
                    invocation,
                    quiet,
                });
                continue;
            }

            let failure = if !permitted {
                Failure::Permission
            } else {
                let result = AssertUnwindSafe(registration.handler.handle(invocation))
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(outcome)) if outcome.allowed => {
                        responses.extend(outcome.responses);
                        continue;
                    }
                    Ok(Ok(outcome)) => Failure::Denied(outcome.responses),
                    Ok(Err(e)) => Failure::Error(e),
                    Err(_) => Failure::Panic,
                }
            };

            let own_responses = match failure {
                Failure::Permission => {
                    HANDLER_FAILURES_TOTAL.with_label_values(&["permission"]).inc();
                    tracing::debug!(
                        dispatch_id = %id,
                        handler = %registration.name,
                        required = %registration.permission,
                        "Permission denied, vetoing dispatch"
                    );
                    Vec::new()
                }
                Failure::Denied(own) => {
                    HANDLER_FAILURES_TOTAL.with_label_values(&["denied"]).inc();
                    tracing::debug!(
                        dispatch_id = %id,
                        handler = %registration.name,
                        "Handler denied, vetoing dispatch"
                    );
                    own
                }
                Failure::Error(e) => {
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                    HANDLER_FAILURES_TOTAL.with_label_values(&["error"]).inc();
                    tracing::error!(
                        dispatch_id = %id,
                        handler = %registration.name,
                        error = %e,
                        "Handler failed"
                    );
                    Vec::new()
                }
                Failure::Panic => {
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                    HANDLER_FAILURES_TOTAL.with_label_values(&["panic"]).inc();
                    tracing::error!(
                        dispatch_id = %id,
                        handler = %registration.name,
                        "Handler panicked"
                    );
                    Vec::new()
                }
            };

            let replayed = rollback.replay().await;
            if replayed > 0 {
                // Earlier responses described effects that were just undone
                responses = own_responses;
                state = DispatchState::RolledBack;
            } else {
                responses.extend(own_responses);
                state = DispatchState::Vetoed;
            }
            break;
        }

        let discarded = rollback.discard();
        if discarded > 0 {
            tracing::trace!(dispatch_id = %id, discarded, "Discarded unused rollback entries");
        }

        if quiet {
            responses.clear();
        } else {
            for response in &responses {
                self.sink.deliver(response.clone()).await;
            }
            self.stats
                .responses_delivered
                .fetch_add(responses.len() as u64, Ordering::Relaxed);
        }

        tracing::debug!(
            dispatch_id = %id,
            state = state.as_str(),
            responses = responses.len(),
            permission_lookups = cache.lookups(),
            "Dispatch finished"
        );

        self.finish(id, state, responses)
    }

    fn finish(
        &self,
        id: Uuid,
        state: DispatchState,
        responses: Vec<OutboundMessage>,
    ) -> DispatchOutcome {
        self.stats.record(state);
        DispatchOutcome {
            id,
            state,
            responses,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::changelog::RetentionPolicy;
    use crate::config::EngineConfig;
    use crate::dispatch::handler::{CommandHandler, HandlerOutcome};
    use crate::dispatch::registry::{CommandPattern, CommandRegistration, Priority};
    use crate::dispatch::rollback::RollbackEntry;
    use crate::messaging::{CollectingSink, Sender};
    use crate::moderation::BasicModeration;
    use crate::permission::PermissionTier;
    use crate::template::FilterRegistry;
    use crate::users::{MemoryUserDirectory, UserRecord};
    use crate::variables::{MemoryVariableBackend, VariableStore};
    use async_trait::async_trait;

    enum Behaviour {
        Respond,
        Deny,
        Fail,
        Panic,
        Charge(i64),
    }

    struct TestHandler {
        name: &'static str,
        behaviour: Behaviour,
        log: Arc<Mutex<Vec<String>>>,
        balance: Arc<AtomicI64>,
    }

    #[async_trait]
    impl CommandHandler for TestHandler {
        async fn handle(&self, invocation: Invocation) -> anyhow::Result<HandlerOutcome> {
            self.log.lock().unwrap().push(self.name.to_string());
            match self.behaviour {
                Behaviour::Respond => Ok(HandlerOutcome::respond(vec![
                    invocation.reply(format!("{} ran", self.name)),
                ])),
                Behaviour::Deny => Ok(HandlerOutcome::denied(vec![
                    invocation.reply(format!("{} said no", self.name)),
                ])),
                Behaviour::Fail => Err(anyhow::anyhow!("{} broke", self.name)),
                Behaviour::Panic => panic!("{} panicked", self.name),
                Behaviour::Charge(amount) => {
                    self.balance.fetch_sub(amount, Ordering::SeqCst);
                    let balance = self.balance.clone();
                    invocation.rollback.register(RollbackEntry::new(
                        "points",
                        invocation.sender_id(),
                        amount,
                        move || async move {
                            balance.fetch_add(amount, Ordering::SeqCst);
                            Ok(())
                        },
                    ));
                    Ok(HandlerOutcome::respond(vec![
                        invocation.reply(format!("charged {}", amount)),
                    ]))
                }
            }
        }
    }

    struct Harness {
        registry: CommandRegistry,
        users: Arc<MemoryUserDirectory>,
        moderation: Arc<BasicModeration>,
        sink: Arc<CollectingSink>,
        log: Arc<Mutex<Vec<String>>>,
        balance: Arc<AtomicI64>,
    }

    impl Harness {
        fn new() -> Self {
            let users = Arc::new(MemoryUserDirectory::new());
            users.upsert(UserRecord::new("1", "alice"));
            users.upsert(UserRecord::new("2", "mod").moderator());

            Self {
                registry: CommandRegistry::new(),
                users,
                moderation: Arc::new(BasicModeration::new()),
                sink: Arc::new(CollectingSink::new()),
                log: Arc::new(Mutex::new(Vec::new())),
                balance: Arc::new(AtomicI64::new(100)),
            }
        }

        fn handler(&self, name: &'static str, behaviour: Behaviour) -> Arc<dyn CommandHandler> {
            Arc::new(TestHandler {
                name,
                behaviour,
                log: self.log.clone(),
                balance: self.balance.clone(),
            })
        }

        fn add(&mut self, registration: CommandRegistration) {
            self.registry.register(registration);
        }

        fn command(
            &mut self,
            name: &'static str,
            pattern: &str,
            priority: Priority,
            behaviour: Behaviour,
        ) {
            let handler = self.handler(name, behaviour);
            self.add(
                CommandRegistration::new(name, CommandPattern::command(pattern), handler)
                    .priority(priority),
            );
        }

        fn build(self) -> Built {
            let variables = Arc::new(VariableStore::new(
                Arc::new(MemoryVariableBackend::new()),
                RetentionPolicy::default(),
                "{{variable}} = {{value}}",
            ));
            let engine = Arc::new(
                ResponseEngine::new(
                    EngineConfig::default(),
                    Arc::new(FilterRegistry::new()),
                    variables,
                    self.users.clone(),
                    self.moderation.clone(),
                )
                .unwrap(),
            );
            let permissions = Arc::new(PermissionResolver::new(self.users.clone(), &[]));
            let (dispatcher, _worker) = Dispatcher::new(
                Arc::new(self.registry),
                engine,
                permissions,
                self.moderation.clone(),
                self.sink.clone(),
            );

            Built {
                dispatcher,
                moderation: self.moderation,
                sink: self.sink,
                log: self.log,
                balance: self.balance,
            }
        }
    }

    struct Built {
        dispatcher: Dispatcher,
        moderation: Arc<BasicModeration>,
        sink: Arc<CollectingSink>,
        log: Arc<Mutex<Vec<String>>>,
        balance: Arc<AtomicI64>,
    }

    impl Built {
        fn ran(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn alice(text: &str) -> ChatMessage {
        ChatMessage::new(Sender::new("1", "alice"), text)
    }

    fn moderator(text: &str) -> ChatMessage {
        ChatMessage::new(Sender::new("2", "mod"), text)
    }

    fn texts(outcome: &DispatchOutcome) -> Vec<&str> {
        outcome.responses.iter().map(|r| r.text.as_str()).collect()
    }

    #[tokio::test]
    async fn test_handlers_run_in_tier_order_and_deliver() {
        let mut h = Harness::new();
        h.command("low", "!hug", Priority::Low, Behaviour::Respond);
        h.command("high", "!hug", Priority::High, Behaviour::Respond);
        h.command("normal", "!hug", Priority::Normal, Behaviour::Respond);
        let built = h.build();

        let outcome = built.dispatcher.dispatch(alice("!hug bob")).await;

        assert_eq!(outcome.state, DispatchState::Delivered);
        assert_eq!(built.ran(), vec!["high", "normal", "low"]);
        assert_eq!(texts(&outcome), vec!["high ran", "normal ran", "low ran"]);
        assert_eq!(built.sink.texts().await, vec!["high ran", "normal ran", "low ran"]);
        assert_eq!(built.dispatcher.stats().total_delivered, 1);
    }

    #[tokio::test]
    async fn test_denial_vetoes_lower_tiers() {
        let mut h = Harness::new();
        h.command("gate", "!hug", Priority::Highest, Behaviour::Deny);
        h.command("hug", "!hug", Priority::Normal, Behaviour::Respond);
        let built = h.build();

        let outcome = built.dispatcher.dispatch(alice("!hug")).await;

        assert_eq!(outcome.state, DispatchState::Vetoed);
        assert_eq!(built.ran(), vec!["gate"]);
        assert_eq!(texts(&outcome), vec!["gate said no"]);
    }

    #[tokio::test]
    async fn test_failure_replays_rollback() {
        let mut h = Harness::new();
        h.command("charge", "!hug", Priority::High, Behaviour::Charge(30));
        h.command("broken", "!hug", Priority::Normal, Behaviour::Fail);
        h.command("never", "!hug", Priority::Low, Behaviour::Respond);
        let built = h.build();

        let outcome = built.dispatcher.dispatch(alice("!hug")).await;

        assert_eq!(outcome.state, DispatchState::RolledBack);
        assert_eq!(built.balance.load(Ordering::SeqCst), 100);
        assert_eq!(built.ran(), vec!["charge", "broken"]);
        assert!(outcome.responses.is_empty());
        assert_eq!(built.dispatcher.stats().handler_failures, 1);
    }

    #[tokio::test]
    async fn test_panic_is_a_failure() {
        let mut h = Harness::new();
        h.command("charge", "!hug", Priority::High, Behaviour::Charge(10));
        h.command("boom", "!hug", Priority::Normal, Behaviour::Panic);
        let built = h.build();

        let outcome = built.dispatcher.dispatch(alice("!hug")).await;

        assert_eq!(outcome.state, DispatchState::RolledBack);
        assert_eq!(built.balance.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_success_discards_rollback() {
        let mut h = Harness::new();
        h.command("charge", "!hug", Priority::High, Behaviour::Charge(10));
        h.command("hug", "!hug", Priority::Normal, Behaviour::Respond);
        let built = h.build();

        let outcome = built.dispatcher.dispatch(alice("!hug")).await;

        assert_eq!(outcome.state, DispatchState::Delivered);
        assert_eq!(built.balance.load(Ordering::SeqCst), 90);
        assert_eq!(texts(&outcome), vec!["charged 10", "hug ran"]);
    }

    #[tokio::test]
    async fn test_permission_failure_vetoes() {
        let mut h = Harness::new();
        let handler = h.handler("modonly", Behaviour::Respond);
        h.add(
            CommandRegistration::new("modonly", CommandPattern::command("!ban"), handler)
                .permission(PermissionTier::Moderator),
        );
        let built = h.build();

        let outcome = built.dispatcher.dispatch(alice("!ban bob")).await;
        assert_eq!(outcome.state, DispatchState::Vetoed);
        assert!(built.ran().is_empty());

        let outcome = built.dispatcher.dispatch(moderator("!ban bob")).await;
        assert_eq!(outcome.state, DispatchState::Delivered);
        assert_eq!(built.ran(), vec!["modonly"]);
    }

    #[tokio::test]
    async fn test_ignored_and_moderated() {
        let mut h = Harness::new();
        h.command("hug", "!hug", Priority::Normal, Behaviour::Respond);
        let built = h.build();
        built.moderation.ignore("alice");
        built.moderation.block_phrase("spam");

        let outcome = built.dispatcher.dispatch(alice("!hug")).await;
        assert_eq!(outcome.state, DispatchState::Ignored);

        let outcome = built.dispatcher.dispatch(moderator("!hug spam")).await;
        assert_eq!(outcome.state, DispatchState::Moderated);

        assert!(built.ran().is_empty());
        assert!(built.sink.texts().await.is_empty());
        let stats = built.dispatcher.stats();
        assert_eq!(stats.total_ignored, 1);
        assert_eq!(stats.total_moderated, 1);
    }

    #[tokio::test]
    async fn test_skip_honoured_only_for_privileged() {
        let mut h = Harness::new();
        let gate = h.handler("gate", Behaviour::Deny);
        h.add(
            CommandRegistration::new("gate", CommandPattern::Any, gate)
                .priority(Priority::High)
                .skippable(),
        );
        h.command("hug", "!hug", Priority::Normal, Behaviour::Respond);
        let built = h.build();

        let outcome = built.dispatcher.dispatch(alice("!hug").skip()).await;
        assert_eq!(outcome.state, DispatchState::Vetoed);

        let outcome = built.dispatcher.dispatch(moderator("!hug").skip()).await;
        assert_eq!(outcome.state, DispatchState::Delivered);
        assert_eq!(texts(&outcome), vec!["hug ran"]);
    }

    #[tokio::test]
    async fn test_quiet_runs_without_delivery() {
        let mut h = Harness::new();
        h.command("charge", "!hug", Priority::Normal, Behaviour::Charge(5));
        let built = h.build();

        let outcome = built.dispatcher.dispatch(alice("!hug").quiet()).await;

        assert_eq!(outcome.state, DispatchState::Delivered);
        assert!(outcome.responses.is_empty());
        assert!(built.sink.texts().await.is_empty());
        assert_eq!(built.balance.load(Ordering::SeqCst), 95);
    }

    #[tokio::test]
    async fn test_fire_and_forget_does_not_block_or_veto() {
        let mut h = Harness::new();
        let detached = h.handler("detached", Behaviour::Fail);
        h.add(
            CommandRegistration::new("detached", CommandPattern::command("!hug"), detached)
                .priority(Priority::Highest)
                .fire_and_forget(),
        );
        let background = h.handler("background", Behaviour::Respond);
        h.add(
            CommandRegistration::new("background", CommandPattern::command("!hug"), background)
                .fire_and_forget(),
        );
        h.command("hug", "!hug", Priority::Low, Behaviour::Respond);
        let built = h.build();

        let outcome = built.dispatcher.dispatch(alice("!hug")).await;
        assert_eq!(outcome.state, DispatchState::Delivered);
        assert_eq!(texts(&outcome), vec!["hug ran"]);

        let mut delivered = Vec::new();
        for _ in 0..50 {
            delivered = built.sink.texts().await;
            if delivered.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(delivered.contains(&"background ran".to_string()));

        let stats = built.dispatcher.detached_stats();
        assert_eq!(stats.queued, 2);
    }
}
