//! Hurobot Core
//!
//! Command tokenizer, registry, dispatcher, and the runtime that feeds them
//! from the event bus

pub mod commands;
pub mod dispatcher;
pub mod registry;
pub mod tokenizer;

pub use dispatcher::{DispatchError, Dispatcher};
pub use registry::{CommandContext, CommandHandler, CommandRegistry, CommandSpec, RegistryError};
pub use tokenizer::{tokenize, ParsedInvocation};

use anyhow::Result;
use hurobot_config::{Config, PermissionsConfig};
use hurobot_ipc::{Message, Outbox};
use hurobot_policy::{PermissionResolver, PolicyStore};
use hurobot_storage::{SqliteStore, Storage};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

pub struct HurobotRuntime {
    config: Arc<Config>,
    store: SqliteStore,
    registry: Arc<CommandRegistry>,
    dispatcher: Arc<Dispatcher>,
    inbound_semaphore: Arc<Semaphore>,
}

impl HurobotRuntime {
    pub fn new(config: Config, storage: Storage, outbox: Outbox) -> Result<Self> {
        let store = SqliteStore::new(
            Arc::new(Mutex::new(storage)),
            config.permissions.clone(),
        );
        let policies: Arc<dyn PolicyStore> = Arc::new(store.clone());
        let roles = Arc::new(store.clone());

        let mut registry = CommandRegistry::new();
        commands::register_builtins(&mut registry, Arc::clone(&policies), roles.clone())?;
        let registry = Arc::new(registry);

        let resolver = PermissionResolver::new(config.permissions.master_id, policies, roles);
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), resolver, outbox));
        let inbound_semaphore = Arc::new(Semaphore::new(config.dispatch.max_concurrency));

        Ok(Self {
            config: Arc::new(config),
            store,
            registry,
            dispatcher,
            inbound_semaphore,
        })
    }

    /// Processes inbound messages until every sender of `inbound` is gone,
    /// then waits for in-flight dispatches to finish.
    pub async fn run(&self, mut inbound: broadcast::Receiver<Message>) -> Result<()> {
        info!(
            "Hurobot runtime starting with {} commands",
            self.registry.len()
        );

        let seeded = self.registry.seed_policies(&self.store).await?;
        if seeded > 0 {
            info!("Seeded {} command policies", seeded);
        }

        loop {
            match inbound.recv().await {
                Ok(message) => {
                    let permit = Arc::clone(&self.inbound_semaphore).acquire_owned().await?;
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let store = self.store.clone();
                    let config = Arc::clone(&self.config);

                    tokio::spawn(async move {
                        Self::process_inbound_message(
                            message,
                            &dispatcher,
                            &store,
                            &config.permissions,
                            permit,
                        )
                        .await;
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event bus closed, stopping message processor");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event bus lagged by {} messages", n);
                }
            }
        }

        let in_flight = u32::try_from(self.config.dispatch.max_concurrency).unwrap_or(u32::MAX);
        let _drained = self.inbound_semaphore.acquire_many(in_flight).await?;
        info!("Hurobot runtime stopped");
        Ok(())
    }

    async fn process_inbound_message(
        message: Message,
        dispatcher: &Dispatcher,
        store: &SqliteStore,
        permissions: &PermissionsConfig,
        _permit: OwnedSemaphorePermit,
    ) {
        if permissions.is_bot(message.user_id) {
            debug!("Ignoring message {} sent by the bot itself", message.message_id);
            return;
        }

        let is_cmd = match dispatcher.dispatch(&message).await {
            Ok(handled) => handled,
            Err(e) => {
                error!(
                    "Error processing message {} from user {}: {}",
                    message.message_id, message.user_id, e
                );
                true
            }
        };

        if let Err(e) = store.storage().lock().await.store_message(&message, is_cmd) {
            warn!("Failed to log message {}: {}", message.message_id, e);
        }
    }
}
