//! Per-message command pipeline
//!
//! tokenize -> lookup -> permission -> prefix gate -> arity -> help -> execute.
//! Each gate either passes the message on or ends dispatch.

use crate::registry::{CommandContext, CommandRegistry};
use crate::tokenizer::{is_help_request, tokenize};
use hurobot_ipc::{Message, Outbox};
use hurobot_policy::PermissionResolver;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("permission lookup for {command:?} failed: {source}")]
    PolicyStore {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("command {command:?} failed: {source}")]
    Handler {
        command: String,
        #[source]
        source: anyhow::Error,
    },
}

pub fn permission_denied_notice(command: &str) -> String {
    format!("{}: Permission denied", command)
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    resolver: PermissionResolver,
    outbox: Outbox,
}

impl Dispatcher {
    pub fn new(registry: Arc<CommandRegistry>, resolver: PermissionResolver, outbox: Outbox) -> Self {
        Self {
            registry,
            resolver,
            outbox,
        }
    }

    /// Returns `Ok(false)` when the message is not a command this bot knows,
    /// `Ok(true)` once a registered command was recognized, whatever the
    /// outcome of the later gates.
    pub async fn dispatch(&self, message: &Message) -> Result<bool, DispatchError> {
        let Some(invocation) = tokenize(message) else {
            return Ok(false);
        };

        let Some(spec) = self.registry.get(&invocation.name) else {
            debug!("Ignoring unknown command '/{}'", invocation.name);
            return Ok(false);
        };

        let Some(args) = invocation.effective_args(spec.need_raw_message) else {
            debug!(
                "Ignoring '/{}' from user {}: unbalanced quoting",
                spec.name, message.user_id
            );
            return Ok(false);
        };

        let decision = match self
            .resolver
            .check(&spec.name, message.user_id, message.group_id)
            .await
        {
            Ok(decision) => decision,
            Err(source) => {
                warn!(
                    "Permission lookup for '{}' failed, denying user {}: {}",
                    spec.name, message.user_id, source
                );
                self.outbox
                    .notice(message, permission_denied_notice(&spec.name));
                return Err(DispatchError::PolicyStore {
                    command: spec.name.clone(),
                    source,
                });
            }
        };

        if !decision.is_allowed() {
            info!(
                "Denied '/{}' for user {} in group {}",
                spec.name, message.user_id, message.group_id
            );
            self.outbox
                .notice(message, permission_denied_notice(&spec.name));
            return Ok(true);
        }

        if invocation.skip > 0 && !spec.allow_prefix {
            debug!(
                "'/{}' issued behind {} prefix segment(s), ignoring",
                spec.name, invocation.skip
            );
            return Ok(true);
        }

        if !spec.accepts_arity(args.len()) || is_help_request(&args) {
            self.outbox.notice(message, spec.help.clone());
            return Ok(true);
        }

        info!(
            "Executing '/{}' for user {} in group {}",
            spec.name, message.user_id, message.group_id
        );
        let ctx = CommandContext {
            message,
            args,
            prefix: &invocation.prefix,
            outbox: &self.outbox,
            registry: &self.registry,
        };
        spec.handler
            .execute(&ctx)
            .await
            .map_err(|source| DispatchError::Handler {
                command: spec.name.clone(),
                source,
            })?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CommandHandler, CommandSpec};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use hurobot_config::{PermissionsConfig, Role};
    use hurobot_ipc::{EventBus, OutboundMessage, Segment, Target};
    use hurobot_policy::{
        GroupDefault, MemoryPolicyStore, MemoryRoles, PermissionPolicy, PolicyStore,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::broadcast;

    const MASTER: u64 = 1;
    const ADMIN: u64 = 2;
    const GUEST: u64 = 3;
    const GROUP: u64 = 500;

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<AtomicUsize>,
        last_args: Arc<StdMutex<Vec<Segment>>>,
    }

    impl Recorder {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn execute(&self, ctx: &CommandContext<'_>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut last) = self.last_args.lock() {
                *last = ctx.args.clone();
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl CommandHandler for Failing {
        async fn execute(&self, _ctx: &CommandContext<'_>) -> Result<()> {
            Err(anyhow!("boom"))
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl PolicyStore for BrokenStore {
        async fn load_policy(&self, _command: &str) -> Result<Option<PermissionPolicy>> {
            Err(anyhow!("database is locked"))
        }

        async fn save_policy(&self, _policy: &PermissionPolicy) -> Result<()> {
            Err(anyhow!("database is locked"))
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<MemoryPolicyStore>,
        outbound: broadcast::Receiver<OutboundMessage>,
        _bus: EventBus,
    }

    impl Harness {
        async fn new(specs: Vec<CommandSpec>) -> Self {
            let store = Arc::new(MemoryPolicyStore::new());
            Self::with_store(specs, store.clone(), store).await
        }

        async fn with_store(
            specs: Vec<CommandSpec>,
            store: Arc<MemoryPolicyStore>,
            policy_store: Arc<dyn PolicyStore>,
        ) -> Self {
            let mut registry = CommandRegistry::new();
            for spec in specs {
                registry.register(spec).expect("register");
            }
            registry
                .seed_policies(store.as_ref())
                .await
                .expect("seed");
            for spec in registry.iter() {
                let mut policy = store
                    .load_policy(&spec.name)
                    .await
                    .expect("load")
                    .expect("seeded");
                policy.group_default = GroupDefault::Enabled;
                store.save_policy(&policy).await.expect("enable");
            }

            let roles = Arc::new(MemoryRoles::new(PermissionsConfig {
                master_id: MASTER,
                bot_id: None,
                admin_ids: vec![ADMIN],
            }));
            let resolver = PermissionResolver::new(MASTER, policy_store, roles);
            let bus = EventBus::new();
            let outbound = bus.outbound_subscribe();
            let dispatcher = Dispatcher::new(
                Arc::new(registry),
                resolver,
                Outbox::new(bus.outbound_sender()),
            );
            Self {
                dispatcher,
                store,
                outbound,
                _bus: bus,
            }
        }

        async fn dispatch(&self, raw: &str, user: u64) -> Result<bool, DispatchError> {
            let msg = Message::from_raw(raw).with_sender(user, GROUP);
            self.dispatcher.dispatch(&msg).await
        }

        fn notices(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(sent) = self.outbound.try_recv() {
                if let OutboundMessage::Send { target, segments } = sent {
                    assert_eq!(target, Target::Group(GROUP));
                    out.extend(segments.iter().filter_map(|s| s.as_text().map(str::to_string)));
                }
            }
            out
        }
    }

    fn echo_spec(recorder: &Recorder) -> CommandSpec {
        CommandSpec::new("echo", "usage: /echo <any>", recorder.clone())
            .with_role(Role::Guest)
            .min_args(2)
            .max_args(2)
    }

    #[tokio::test]
    async fn empty_and_plain_messages_are_not_handled() {
        let recorder = Recorder::default();
        let h = Harness::new(vec![echo_spec(&recorder)]).await;
        let empty = Message::from_segments(Vec::new()).with_sender(GUEST, GROUP);
        assert!(!h.dispatcher.dispatch(&empty).await.expect("dispatch"));
        assert!(!h.dispatch("echo hi", GUEST).await.expect("dispatch"));
        assert!(!h.dispatch("/unknown hi", GUEST).await.expect("dispatch"));
        assert_eq!(recorder.calls(), 0);
    }

    #[tokio::test]
    async fn executes_with_split_args() {
        let recorder = Recorder::default();
        let h = Harness::new(vec![echo_spec(&recorder)]).await;
        assert!(h.dispatch("/echo \"hello world\"", GUEST).await.expect("dispatch"));
        assert_eq!(recorder.calls(), 1);
        let last = recorder.last_args.lock().expect("lock").clone();
        assert_eq!(last, vec![Segment::text("echo"), Segment::text("hello world")]);
    }

    #[tokio::test]
    async fn arity_violation_sends_help() {
        let recorder = Recorder::default();
        let mut h = Harness::new(vec![echo_spec(&recorder)]).await;
        assert!(h.dispatch("/echo", GUEST).await.expect("dispatch"));
        assert!(h.dispatch("/echo a b", GUEST).await.expect("dispatch"));
        assert_eq!(recorder.calls(), 0);
        assert_eq!(h.notices(), vec!["usage: /echo <any>"; 2]);
    }

    #[tokio::test]
    async fn help_flags_never_execute() {
        let recorder = Recorder::default();
        let mut h = Harness::new(vec![echo_spec(&recorder)]).await;
        for flag in ["-h", "-?", "--help"] {
            assert!(h
                .dispatch(&format!("/echo {}", flag), GUEST)
                .await
                .expect("dispatch"));
        }
        assert_eq!(recorder.calls(), 0);
        assert_eq!(h.notices().len(), 3);
    }

    #[tokio::test]
    async fn denied_caller_gets_notice() {
        let recorder = Recorder::default();
        let spec = CommandSpec::new("sh", "usage: /sh <cmd>", recorder.clone()).need_raw_message();
        let mut h = Harness::new(vec![spec]).await;

        assert!(h.dispatch("/sh ls", ADMIN).await.expect("dispatch"));
        assert_eq!(recorder.calls(), 0);
        assert_eq!(h.notices(), vec!["sh: Permission denied"]);

        assert!(h.dispatch("/sh ls", MASTER).await.expect("dispatch"));
        assert_eq!(recorder.calls(), 1);
    }

    #[tokio::test]
    async fn raw_commands_accept_unbalanced_quotes() {
        let raw = Recorder::default();
        let split = Recorder::default();
        let h = Harness::new(vec![
            CommandSpec::new("sh", "", raw.clone()).need_raw_message(),
            echo_spec(&split),
        ])
        .await;

        assert!(h.dispatch("/sh echo \"x", MASTER).await.expect("dispatch"));
        assert_eq!(
            raw.last_args.lock().expect("lock").clone(),
            vec![Segment::text("sh"), Segment::text("echo \"x")]
        );
        assert!(!h.dispatch("/echo \"x", MASTER).await.expect("dispatch"));
        assert_eq!(split.calls(), 0);
    }

    #[tokio::test]
    async fn prefix_gate_is_silent() {
        let recorder = Recorder::default();
        let mut h = Harness::new(vec![echo_spec(&recorder)]).await;
        assert!(h
            .dispatch("[CQ:reply,id=9]/echo hi", GUEST)
            .await
            .expect("dispatch"));
        assert_eq!(recorder.calls(), 0);
        assert!(h.notices().is_empty());
    }

    #[tokio::test]
    async fn prefix_allowed_commands_run_behind_reply() {
        let recorder = Recorder::default();
        let spec = CommandSpec::new("delete", "", recorder.clone())
            .with_role(Role::Guest)
            .allow_prefix()
            .max_args(1);
        let h = Harness::new(vec![spec]).await;
        assert!(h
            .dispatch("[CQ:reply,id=9][CQ:at,qq=4] /delete", GUEST)
            .await
            .expect("dispatch"));
        assert_eq!(recorder.calls(), 1);
    }

    #[tokio::test]
    async fn policy_edits_apply_to_next_dispatch() {
        let recorder = Recorder::default();
        let mut h = Harness::new(vec![echo_spec(&recorder)]).await;
        let mut policy = h
            .store
            .load_policy("echo")
            .await
            .expect("load")
            .expect("seeded");
        policy.reject_users.insert(GUEST);
        h.store.save_policy(&policy).await.expect("save");

        assert!(h.dispatch("/echo hi", GUEST).await.expect("dispatch"));
        assert_eq!(recorder.calls(), 0);
        assert_eq!(h.notices(), vec!["echo: Permission denied"]);
    }

    #[tokio::test]
    async fn store_failure_denies_and_reports() {
        let recorder = Recorder::default();
        let mut h = Harness::with_store(
            vec![echo_spec(&recorder)],
            Arc::new(MemoryPolicyStore::new()),
            Arc::new(BrokenStore),
        )
        .await;

        let err = h.dispatch("/echo hi", GUEST).await.expect_err("store error");
        assert!(matches!(err, DispatchError::PolicyStore { ref command, .. } if command == "echo"));
        assert_eq!(h.notices(), vec!["echo: Permission denied"]);

        // master never reaches the store
        assert!(h.dispatch("/echo hi", MASTER).await.expect("dispatch"));
        assert_eq!(recorder.calls(), 1);
    }

    #[tokio::test]
    async fn handler_errors_are_returned() {
        let spec = CommandSpec::new("fail", "", Failing).with_role(Role::Guest);
        let h = Harness::new(vec![spec]).await;
        let err = h.dispatch("/fail", GUEST).await.expect_err("handler error");
        assert!(matches!(err, DispatchError::Handler { ref command, .. } if command == "fail"));
    }
}
