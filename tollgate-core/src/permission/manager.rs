//! Layered rule evaluation with suspending asks.

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

use super::types::{AskRequest, PermissionError, PermissionRequest, Reply};
use crate::config::PermissionConfig;
use crate::events::{self, EventEmitter, NoopEmitter, TollgateEvent};
use crate::rules::{evaluate_with_args, get_disabled_tools, Action, Mode, PermissionRule, Ruleset};

/// How a pending ask was resolved.
#[derive(Debug)]
enum Resolution {
    Approved,
    Rejected { message: Option<String> },
}

struct PendingAsk {
    request: PermissionRequest,
    responder: oneshot::Sender<Resolution>,
}

struct ManagerState {
    mode: Mode,
    mode_rules: Ruleset,
    approved: Ruleset,
    pending: HashMap<String, PendingAsk>,
}

impl ManagerState {
    fn action_for(
        &self,
        base: &Ruleset,
        permission: &str,
        target: &str,
        arguments: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Action {
        evaluate_with_args(
            permission,
            target,
            arguments,
            &[base, &self.mode_rules, &self.approved],
        )
        .action()
    }

    /// Remove every pending request of a session.
    fn drain_session(&mut self, session_id: &str) -> Vec<PendingAsk> {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.request.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.pending.remove(id))
            .collect()
    }
}

/// Owns the base, mode and approved rule layers plus the pending asks.
///
/// Evaluation order is always base, then mode, then approved, so a rule
/// recorded by an "always" reply outranks both configuration and mode.
///
/// # Example
///
/// ```rust
/// use tollgate_core::permission::{AskRequest, PermissionManager};
///
/// # tokio_test::block_on(async {
/// let manager = PermissionManager::builder().build();
///
/// // The default base ruleset allows ordinary reads
/// manager
///     .ask(AskRequest::new("session-1", "read", ["src/main.rs"]))
///     .await
///     .unwrap();
/// # });
/// ```
pub struct PermissionManager {
    base: Ruleset,
    state: Mutex<ManagerState>,
    emitter: Arc<dyn EventEmitter>,
    config: PermissionConfig,
}

impl PermissionManager {
    /// Start building a manager.
    pub fn builder() -> PermissionManagerBuilder {
        PermissionManagerBuilder::new()
    }

    /// Check every pattern of a request, suspending on each one that asks.
    ///
    /// Patterns are evaluated in order. An allowed pattern is skipped, a
    /// denied pattern fails the whole call immediately, and an ask suspends
    /// under a fresh request id until replied. Returns once every pattern
    /// has cleared.
    pub async fn ask(&self, request: AskRequest) -> Result<(), PermissionError> {
        let AskRequest {
            session_id,
            permission,
            patterns,
            always,
            metadata,
            arguments,
        } = request;

        for pattern in &patterns {
            let action =
                self.state
                    .lock()
                    .action_for(&self.base, &permission, pattern, arguments.as_ref());

            match action {
                Action::Allow => continue,
                Action::Deny => {
                    debug!("Permission {} denied for {}", permission, pattern);
                    return Err(PermissionError::Denied {
                        permission,
                        pattern: pattern.clone(),
                    });
                }
                Action::Ask => {
                    debug!("Permission {} asks for {}", permission, pattern);
                    let pending = PermissionRequest {
                        id: new_request_id(),
                        session_id: session_id.clone(),
                        permission: permission.clone(),
                        patterns: patterns.clone(),
                        always: always.clone(),
                        metadata: metadata.clone(),
                        arguments: arguments.clone(),
                        created_at: Utc::now(),
                    };
                    self.suspend(pending).await?;
                }
            }
        }

        Ok(())
    }

    async fn suspend(&self, request: PermissionRequest) -> Result<(), PermissionError> {
        let request_id = request.id.clone();
        let session_id = request.session_id.clone();
        let event = TollgateEvent::PermissionAsked {
            request_id: request.id.clone(),
            session_id: request.session_id.clone(),
            permission: request.permission.clone(),
            patterns: request.patterns.clone(),
            always: request.always.clone(),
            metadata: request.metadata.clone(),
        };

        let (tx, rx) = oneshot::channel();
        self.state.lock().pending.insert(
            request_id.clone(),
            PendingAsk {
                request,
                responder: tx,
            },
        );
        let _guard = PendingGuard {
            state: &self.state,
            request_id: request_id.clone(),
        };
        debug!("Permission request {} pending", request_id);

        // Nobody can answer an unannounced request
        events::emit(self.emitter.as_ref(), &session_id, &event)
            .await
            .map_err(PermissionError::Announce)?;

        let resolution = match self.config.ask_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(resolution) => resolution,
                Err(_) => {
                    warn!("Permission request {} timed out", request_id);
                    return Err(PermissionError::TimedOut { request_id });
                }
            },
            None => rx.await,
        };

        match resolution {
            Ok(Resolution::Approved) => Ok(()),
            Ok(Resolution::Rejected { message }) => Err(PermissionError::Rejected {
                request_id,
                message,
            }),
            // Responder dropped without an answer
            Err(_) => Err(PermissionError::Rejected {
                request_id,
                message: None,
            }),
        }
    }

    /// Answer a pending request.
    ///
    /// - `Reject` rejects the request and every other pending request of the
    ///   same session.
    /// - `Once` approves the request only.
    /// - `Always` records an allow rule per `always` pattern, approves the
    ///   request, then auto-approves other pending requests of the session
    ///   whose every pattern now evaluates to allow. With no `always`
    ///   patterns nothing is recorded.
    pub async fn reply(
        &self,
        request_id: &str,
        reply: Reply,
        message: Option<String>,
    ) -> Result<(), PermissionError> {
        match reply {
            Reply::Reject => self.reject(request_id, message).await,
            Reply::Once => {
                let target = self
                    .state
                    .lock()
                    .pending
                    .remove(request_id)
                    .ok_or_else(|| PermissionError::RequestNotFound(request_id.to_string()))?;
                let _ = target.responder.send(Resolution::Approved);
                self.notify_replied(&target.request, Reply::Once, None).await;
                Ok(())
            }
            Reply::Always => self.approve_always(request_id).await,
        }
    }

    async fn reject(&self, request_id: &str, message: Option<String>) -> Result<(), PermissionError> {
        let (target, cascaded) = {
            let mut state = self.state.lock();
            let target = state
                .pending
                .remove(request_id)
                .ok_or_else(|| PermissionError::RequestNotFound(request_id.to_string()))?;
            let cascaded = state.drain_session(&target.request.session_id);
            (target, cascaded)
        };

        let session_id = target.request.session_id.clone();
        let _ = target.responder.send(Resolution::Rejected { message });
        self.notify_replied(&target.request, Reply::Reject, None)
            .await;

        for pending in &cascaded {
            debug!("Rejecting {} by cascade", pending.request.id);
        }
        let count = cascaded.len();
        for pending in cascaded {
            let _ = pending
                .responder
                .send(Resolution::Rejected { message: None });
            self.notify_replied(&pending.request, Reply::Reject, None)
                .await;
        }

        if count > 0 {
            info!(
                "Rejected {} additional pending request(s) for session {}",
                count, session_id
            );
        }
        Ok(())
    }

    async fn approve_always(&self, request_id: &str) -> Result<(), PermissionError> {
        let (target, auto_approved) = {
            let mut state = self.state.lock();
            let pending = state
                .pending
                .get(request_id)
                .ok_or_else(|| PermissionError::RequestNotFound(request_id.to_string()))?;

            // Validate before mutating anything
            let rules = pending
                .request
                .always
                .iter()
                .map(|pattern| {
                    PermissionRule::new(&pending.request.permission, pattern, Action::Allow)
                })
                .collect::<Result<Vec<_>, _>>()?;

            let Some(target) = state.pending.remove(request_id) else {
                return Err(PermissionError::RequestNotFound(request_id.to_string()));
            };
            state.approved.extend(rules);

            let session_id = &target.request.session_id;
            let ready: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, p)| &p.request.session_id == session_id)
                .filter(|(_, p)| {
                    p.request.patterns.iter().all(|pattern| {
                        state.action_for(
                            &self.base,
                            &p.request.permission,
                            pattern,
                            p.request.arguments.as_ref(),
                        ) == Action::Allow
                    })
                })
                .map(|(id, _)| id.clone())
                .collect();
            let auto_approved: Vec<PendingAsk> = ready
                .iter()
                .filter_map(|id| state.pending.remove(id))
                .collect();

            (target, auto_approved)
        };

        let _ = target.responder.send(Resolution::Approved);
        self.notify_replied(&target.request, Reply::Always, None)
            .await;

        if !auto_approved.is_empty() {
            info!(
                "Auto-approved {} pending request(s) for session {}",
                auto_approved.len(),
                target.request.session_id
            );
        }
        for pending in auto_approved {
            let _ = pending.responder.send(Resolution::Approved);
            self.notify_replied(&pending.request, Reply::Always, Some(true))
                .await;
        }
        Ok(())
    }

    /// Reject every pending request of a session. Returns how many were rejected.
    pub async fn cancel_all(&self, session_id: &str) -> usize {
        let cancelled = self.state.lock().drain_session(session_id);
        let count = cancelled.len();

        for pending in cancelled {
            let _ = pending.responder.send(Resolution::Rejected {
                message: Some("cancelled".to_string()),
            });
            self.notify_replied(&pending.request, Reply::Reject, None)
                .await;
        }

        if count > 0 {
            info!(
                "Cancelled {} pending permission request(s) for session {}",
                count, session_id
            );
        }
        count
    }

    async fn notify_replied(
        &self,
        request: &PermissionRequest,
        reply: Reply,
        auto_approved: Option<bool>,
    ) {
        let event = TollgateEvent::PermissionReplied {
            request_id: request.id.clone(),
            session_id: request.session_id.clone(),
            reply,
            auto_approved,
        };
        // Resolution is already committed, so this is best-effort
        if let Err(e) = events::emit(self.emitter.as_ref(), &request.session_id, &event).await {
            warn!(
                "Failed to publish reply for permission request {}: {}",
                request.id, e
            );
        }
    }

    /// Replace the mode layer.
    pub fn set_mode(&self, mode: Mode) {
        let mut state = self.state.lock();
        state.mode = mode;
        state.mode_rules = mode.ruleset();
        debug!("Permission mode set to {}", mode);
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    /// Action for a permission/target pair across all layers, without asking.
    pub fn evaluate(&self, permission: &str, target: &str) -> Action {
        self.state
            .lock()
            .action_for(&self.base, permission, target, None)
    }

    /// Tools hidden up front because every call would be denied.
    pub fn disabled_tools<S: AsRef<str>>(&self, tools: &[S]) -> Vec<String> {
        let merged = {
            let state = self.state.lock();
            self.base
                .iter()
                .chain(state.mode_rules.iter())
                .chain(state.approved.iter())
                .cloned()
                .collect::<Ruleset>()
        };
        get_disabled_tools(tools, &merged)
    }

    /// Pending requests, oldest first, optionally filtered to one session.
    pub fn list_pending(&self, session_id: Option<&str>) -> Vec<PermissionRequest> {
        let mut pending: Vec<PermissionRequest> = self
            .state
            .lock()
            .pending
            .values()
            .filter(|p| session_id.map_or(true, |s| p.request.session_id == s))
            .map(|p| p.request.clone())
            .collect();
        pending.sort_by_key(|p| p.created_at);
        pending
    }

    /// Number of pending requests in a session.
    pub fn pending_count(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .pending
            .values()
            .filter(|p| p.request.session_id == session_id)
            .count()
    }

    /// Rules recorded by "always" replies, in recording order.
    pub fn approved_rules(&self) -> Ruleset {
        self.state.lock().approved.clone()
    }

    /// The base layer.
    pub fn base_rules(&self) -> &Ruleset {
        &self.base
    }
}

impl Default for PermissionManager {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Removes a pending entry on every exit path of a suspended ask.
struct PendingGuard<'a> {
    state: &'a Mutex<ManagerState>,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().pending.remove(&self.request_id);
    }
}

fn new_request_id() -> String {
    format!("per_{}", uuid::Uuid::new_v4().simple())
}

/// Builder for [`PermissionManager`].
pub struct PermissionManagerBuilder {
    base: Option<Ruleset>,
    emitter: Option<Arc<dyn EventEmitter>>,
    config: PermissionConfig,
    mode: Mode,
}

impl PermissionManagerBuilder {
    /// Create a builder with the default base rules and no emitter.
    pub fn new() -> Self {
        Self {
            base: None,
            emitter: None,
            config: PermissionConfig::default(),
            mode: Mode::default(),
        }
    }

    /// Set the base layer. Defaults to [`Ruleset::default_base`].
    pub fn with_base_rules(mut self, rules: Ruleset) -> Self {
        self.base = Some(rules);
        self
    }

    /// Set the emitter for asked and replied events.
    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Set manager settings.
    pub fn with_config(mut self, config: PermissionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the initial mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Build the manager.
    pub fn build(self) -> PermissionManager {
        PermissionManager {
            base: self.base.unwrap_or_else(Ruleset::default_base),
            state: Mutex::new(ManagerState {
                mode: self.mode,
                mode_rules: self.mode.ruleset(),
                approved: Ruleset::new(),
                pending: HashMap::new(),
            }),
            emitter: self.emitter.unwrap_or_else(|| Arc::new(NoopEmitter)),
            config: self.config,
        }
    }
}

impl Default for PermissionManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
