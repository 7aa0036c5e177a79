//! Per-conversation HITL orchestration.

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::directory::{RequestDirectory, RequestResolver};
use super::strategy::{is_cancellation, strategy_for, HitlStrategy};
use super::types::{
    BuildError, ClarificationData, ConversationScope, DecisionData, EnvVarData, HitlError,
    HitlRequest, InteractionType, PermissionData,
};
use crate::bus::{MessageBus, ResponseListener};
use crate::config::HitlConfig;
use crate::events::{self, EventEmitter, TollgateEvent};
use crate::store::{cancellation_payload, RequestStore};

/// How a wait ended.
enum Outcome {
    Delivered(Value),
    TimedOut,
    Cancelled(String),
}

struct CoordinatorInner {
    scope: ConversationScope,
    store: Arc<dyn RequestStore>,
    emitter: Arc<dyn EventEmitter>,
    directory: Arc<RequestDirectory>,
    bus: Option<Arc<dyn MessageBus>>,
    config: HitlConfig,
    // A slot holds its sender until the first resolution takes it
    slots: Mutex<HashMap<String, Option<oneshot::Sender<Value>>>>,
    shutdown: CancellationToken,
}

impl RequestResolver for CoordinatorInner {
    fn resolve(&self, request_id: &str, payload: Value) -> bool {
        let sender = match self.slots.lock().get_mut(request_id) {
            Some(slot) => match slot.take() {
                Some(sender) => sender,
                None => {
                    warn!("Ignoring duplicate resolution for {}", request_id);
                    return false;
                }
            },
            None => {
                debug!("No slot for {}", request_id);
                return false;
            }
        };
        sender.send(payload).is_ok()
    }
}

/// Suspends agent execution on human interactions for one conversation.
///
/// Every request gets a fresh correlation id, a single-use result slot and
/// a directory entry, so a response arriving through any channel (a reply
/// handler in this process, or a [`MessageBus`] consumer) reaches the
/// right waiter. Slot and directory entry are removed on every exit path.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tollgate_core::events::NoopEmitter;
/// use tollgate_core::hitl::{ConversationScope, HitlCoordinator, InteractionType, RequestDirectory};
/// use tollgate_core::store::MemoryRequestStore;
///
/// # tokio_test::block_on(async {
/// let coordinator = HitlCoordinator::builder(ConversationScope::new("conv-1", "tenant", "project"))
///     .with_store(Arc::new(MemoryRequestStore::new()))
///     .with_emitter(Arc::new(NoopEmitter))
///     .with_directory(RequestDirectory::shared())
///     .build()
///     .unwrap();
///
/// // Nobody answers, so the strategy default comes back
/// let answer = coordinator
///     .request(
///         InteractionType::Clarification,
///         serde_json::json!({"question": "Table name?", "default_value": "users"}),
///         Some(Duration::from_millis(10)),
///     )
///     .await
///     .unwrap();
/// assert_eq!(answer, "users");
/// # });
/// ```
#[derive(Clone)]
pub struct HitlCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl HitlCoordinator {
    /// Start building a coordinator for a conversation.
    pub fn builder(scope: ConversationScope) -> HitlCoordinatorBuilder {
        HitlCoordinatorBuilder::new(scope)
    }

    /// Ask a human and wait for the answer.
    ///
    /// `timeout` defaults to the interaction type's configured wait. On
    /// timeout or cancellation the strategy default is returned; requests
    /// without a safe default fail with [`HitlError::Denied`]. Persist and
    /// announce failures abort the request.
    pub async fn request(
        &self,
        interaction_type: InteractionType,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, HitlError> {
        let inner = &self.inner;
        let strategy = strategy_for(interaction_type);
        let timeout = timeout.unwrap_or_else(|| strategy.default_timeout(&inner.config));

        let request_id = new_request_id();
        let request = strategy.create_request(&request_id, &inner.scope, data, timeout)?;

        let (tx, rx) = oneshot::channel();
        inner.slots.lock().insert(request_id.clone(), Some(tx));
        let resolver: Weak<dyn RequestResolver> = Arc::downgrade(inner) as Weak<CoordinatorInner>;
        inner.directory.register(request_id.clone(), resolver);
        let mut guard = SlotGuard {
            inner,
            request_id: &request_id,
            listener: None,
        };

        inner.store.create(&request).await.map_err(HitlError::Persist)?;

        let announced = events::emit(
            inner.emitter.as_ref(),
            &inner.scope.conversation_id,
            &TollgateEvent::asked(&request),
        )
        .await;
        if let Err(e) = announced {
            if let Err(store_err) = inner
                .store
                .mark_cancelled(&request_id, Some("announce failed"))
                .await
            {
                warn!("Failed to cancel unannounced request {}: {}", request_id, store_err);
            }
            return Err(HitlError::Announce(e));
        }

        if let Some(bus) = &inner.bus {
            let listener = ResponseListener::new(
                bus.clone(),
                inner.directory.clone(),
                inner.config.listener.clone(),
            );
            guard.listener = Some(listener.spawn(request_id.clone()));
        }
        debug!(
            "{} request {} pending for {:?}",
            interaction_type, request_id, timeout
        );

        let outcome = tokio::select! {
            received = rx => match received {
                Ok(payload) => Outcome::Delivered(payload),
                Err(_) => Outcome::Cancelled("slot dropped".to_string()),
            },
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = inner.shutdown.cancelled() => Outcome::Cancelled("shutdown".to_string()),
        };

        self.settle(strategy, &request, outcome).await
    }

    async fn settle(
        &self,
        strategy: &dyn HitlStrategy,
        request: &HitlRequest,
        outcome: Outcome,
    ) -> Result<Value, HitlError> {
        let store = &self.inner.store;
        let (marked, reason, timed_out) = match outcome {
            Outcome::Delivered(payload) if !is_cancellation(&payload) => {
                let value = strategy.extract_response_value(request, &payload);
                // A remote responder may have recorded the answer already
                if let Err(e) = store.mark_answered(&request.id, &payload).await {
                    warn!("Failed to mark {} answered: {}", request.id, e);
                }
                debug!("Request {} answered", request.id);
                return Ok(value);
            }
            Outcome::Delivered(payload) => {
                let timed_out = !payload
                    .get("cancelled")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if timed_out {
                    (
                        store.mark_timed_out(&request.id).await,
                        "timed out".to_string(),
                        true,
                    )
                } else {
                    let reason = payload
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("cancelled")
                        .to_string();
                    (
                        store.mark_cancelled(&request.id, Some(&reason)).await,
                        reason,
                        false,
                    )
                }
            }
            Outcome::TimedOut => (
                store.mark_timed_out(&request.id).await,
                "timed out".to_string(),
                true,
            ),
            Outcome::Cancelled(reason) => (
                store.mark_cancelled(&request.id, Some(&reason)).await,
                reason,
                false,
            ),
        };
        if let Err(e) = marked {
            warn!("Failed to record outcome of {}: {}", request.id, e);
        }

        match strategy.default_response(request) {
            Some(value) => {
                info!("Request {} {}, using default response", request.id, reason);
                Ok(value)
            }
            None => {
                info!("Request {} {} with no safe default, denying", request.id, reason);
                Err(HitlError::Denied {
                    request_id: request.id.clone(),
                    reason,
                    timed_out,
                })
            }
        }
    }

    async fn typed<T: Serialize>(
        &self,
        interaction_type: InteractionType,
        data: &T,
        timeout: Option<Duration>,
    ) -> Result<Value, HitlError> {
        let data = serde_json::to_value(data).map_err(|e| HitlError::InvalidRequest {
            interaction_type,
            reason: e.to_string(),
        })?;
        self.request(interaction_type, data, timeout).await
    }

    /// Ask a clarification question. Returns the answer.
    pub async fn clarify(
        &self,
        data: &ClarificationData,
        timeout: Option<Duration>,
    ) -> Result<Value, HitlError> {
        self.typed(InteractionType::Clarification, data, timeout).await
    }

    /// Ask for a decision. Returns the chosen option id.
    pub async fn decide(
        &self,
        data: &DecisionData,
        timeout: Option<Duration>,
    ) -> Result<Value, HitlError> {
        self.typed(InteractionType::Decision, data, timeout).await
    }

    /// Collect environment values. Returns an object keyed by field name.
    pub async fn collect_env_vars(
        &self,
        data: &EnvVarData,
        timeout: Option<Duration>,
    ) -> Result<Value, HitlError> {
        self.typed(InteractionType::EnvVar, data, timeout).await
    }

    /// Ask for explicit approval. Returns whether it was granted.
    pub async fn ask_permission(
        &self,
        data: &PermissionData,
        timeout: Option<Duration>,
    ) -> Result<bool, HitlError> {
        let value = self
            .typed(InteractionType::Permission, data, timeout)
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Fill the slot of a request owned by this coordinator.
    ///
    /// Returns `false` if the id is unknown or already resolved.
    pub fn resolve(&self, request_id: &str, payload: Value) -> bool {
        self.inner.resolve(request_id, payload)
    }

    /// Cancel every outstanding request. Returns how many were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let senders: Vec<oneshot::Sender<Value>> = self
            .inner
            .slots
            .lock()
            .values_mut()
            .filter_map(Option::take)
            .collect();

        let payload = cancellation_payload(Some(reason));
        let count = senders
            .into_iter()
            .map(|sender| sender.send(payload.clone()))
            .filter(Result::is_ok)
            .count();
        if count > 0 {
            info!(
                "Cancelled {} request(s) in conversation {}: {}",
                count, self.inner.scope.conversation_id, reason
            );
        }
        count
    }

    /// End every in-flight wait as cancelled. Later requests end immediately.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Number of outstanding requests.
    pub fn pending_count(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// The conversation this coordinator serves.
    pub fn scope(&self) -> &ConversationScope {
        &self.inner.scope
    }

    /// The directory requests are registered in.
    pub fn directory(&self) -> &Arc<RequestDirectory> {
        &self.inner.directory
    }
}

/// Releases a request's slot, directory entry and listener.
struct SlotGuard<'a> {
    inner: &'a Arc<CoordinatorInner>,
    request_id: &'a str,
    listener: Option<JoinHandle<()>>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.inner.slots.lock().remove(self.request_id);
        self.inner.directory.unregister(self.request_id);

        let Some(listener) = self.listener.take() else {
            return;
        };
        listener.abort();
        if let (Some(bus), Ok(runtime)) = (
            self.inner.bus.clone(),
            tokio::runtime::Handle::try_current(),
        ) {
            let request_id = self.request_id.to_string();
            runtime.spawn(async move {
                if let Err(e) = bus.delete_stream(&request_id).await {
                    warn!("Failed to delete response stream for {}: {}", request_id, e);
                }
            });
        }
    }
}

fn new_request_id() -> String {
    format!("hitl_{}", uuid::Uuid::new_v4().simple())
}

/// Builder for [`HitlCoordinator`].
pub struct HitlCoordinatorBuilder {
    scope: ConversationScope,
    store: Option<Arc<dyn RequestStore>>,
    emitter: Option<Arc<dyn EventEmitter>>,
    directory: Option<Arc<RequestDirectory>>,
    bus: Option<Arc<dyn MessageBus>>,
    config: HitlConfig,
    shutdown: Option<CancellationToken>,
}

impl HitlCoordinatorBuilder {
    /// Create a builder for a conversation.
    pub fn new(scope: ConversationScope) -> Self {
        Self {
            scope,
            store: None,
            emitter: None,
            directory: None,
            bus: None,
            config: HitlConfig::default(),
            shutdown: None,
        }
    }

    /// Set the durable request store. Required.
    pub fn with_store(mut self, store: Arc<dyn RequestStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the announcement emitter. Required.
    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Set the process-wide request directory. Required.
    pub fn with_directory(mut self, directory: Arc<RequestDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Receive responses from other processes over a message bus.
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set timeouts and listener settings.
    pub fn with_config(mut self, config: HitlConfig) -> Self {
        self.config = config;
        self
    }

    /// Tie shutdown to an outer token, e.g. a child of a process-wide one.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Build the coordinator.
    pub fn build(self) -> Result<HitlCoordinator, BuildError> {
        Ok(HitlCoordinator {
            inner: Arc::new(CoordinatorInner {
                scope: self.scope,
                store: self.store.ok_or(BuildError::MissingStore)?,
                emitter: self.emitter.ok_or(BuildError::MissingEmitter)?,
                directory: self.directory.ok_or(BuildError::MissingDirectory)?,
                bus: self.bus,
                config: self.config,
                slots: Mutex::new(HashMap::new()),
                shutdown: self.shutdown.unwrap_or_else(CancellationToken::new),
            }),
        })
    }
}
