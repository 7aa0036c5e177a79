//! Common test utilities shared across test files.
//!
//! Items here may not be used by all test files, hence the module-level allow.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tollgate_core::hitl::{ConversationScope, HitlCoordinator, RequestDirectory};
use tollgate_core::permission::PermissionManager;
use tollgate_core::rules::{Action, Ruleset};
use tollgate_core::store::MemoryRequestStore;
use tollgate_core::test_utils::RecordingEmitter;
use tollgate_core::{HitlConfig, ListenerConfig, MessageBus};

/// Base rules that allow everything except `bash`, which asks.
pub fn bash_asks() -> Ruleset {
    Ruleset::from_entries([("*", "*", Action::Allow), ("bash", "*", Action::Ask)]).unwrap()
}

/// A manager over `rules` that records its events.
pub fn recording_manager(rules: Ruleset) -> (Arc<PermissionManager>, Arc<RecordingEmitter>) {
    let recorder = Arc::new(RecordingEmitter::new());
    let manager = PermissionManager::builder()
        .with_base_rules(rules)
        .with_emitter(recorder.clone())
        .build();
    (Arc::new(manager), recorder)
}

/// Wait until the manager holds `count` pending requests for a session.
pub async fn wait_for_pending(manager: &PermissionManager, session: &str, count: usize) {
    for _ in 0..400 {
        if manager.pending_count(session) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {} pending request(s) in {}, found {}",
        count,
        session,
        manager.pending_count(session)
    );
}

pub fn scope(conversation: &str) -> ConversationScope {
    ConversationScope::new(conversation, "tenant-1", "project-1")
}

/// Everything a coordinator test needs to inspect afterwards.
pub struct Harness {
    pub coordinator: HitlCoordinator,
    pub store: Arc<MemoryRequestStore>,
    pub recorder: Arc<RecordingEmitter>,
    pub directory: Arc<RequestDirectory>,
}

pub fn harness(conversation: &str) -> Harness {
    let store = Arc::new(MemoryRequestStore::new());
    let recorder = Arc::new(RecordingEmitter::new());
    let directory = RequestDirectory::shared();
    let coordinator = HitlCoordinator::builder(scope(conversation))
        .with_store(store.clone())
        .with_emitter(recorder.clone())
        .with_directory(directory.clone())
        .build()
        .unwrap();
    Harness {
        coordinator,
        store,
        recorder,
        directory,
    }
}

/// Like [`harness`], with responses arriving over `bus`.
pub fn bus_harness(
    conversation: &str,
    bus: Arc<dyn MessageBus>,
    store: Arc<MemoryRequestStore>,
    directory: Arc<RequestDirectory>,
) -> Harness {
    let recorder = Arc::new(RecordingEmitter::new());
    let config = HitlConfig {
        listener: ListenerConfig {
            block: Duration::from_millis(20),
            ..ListenerConfig::default()
        },
        ..HitlConfig::default()
    };
    let coordinator = HitlCoordinator::builder(scope(conversation))
        .with_store(store.clone())
        .with_emitter(recorder.clone())
        .with_directory(directory.clone())
        .with_bus(bus)
        .with_config(config)
        .build()
        .unwrap();
    Harness {
        coordinator,
        store,
        recorder,
        directory,
    }
}
