use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tollgate_core::events::NoopEmitter;
use tollgate_core::hitl::{
    ConversationScope, DecisionData, HitlCoordinator, InteractionOption, RequestDirectory,
    RequestStatus,
};
use tollgate_core::store::RequestStore;
use tollgate_sqlite::SqliteRequestStore;

fn decision() -> DecisionData {
    DecisionData {
        question: "Rollback?".into(),
        options: vec![
            InteractionOption::new("no", "Keep going").recommended(),
            InteractionOption::new("yes", "Roll back"),
        ],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_coordinator_records_outcomes() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteRequestStore::new(temp_dir.path().join("requests.db")).unwrap());
    let directory = RequestDirectory::shared();
    let coordinator = HitlCoordinator::builder(ConversationScope::new("conv-1", "t", "p"))
        .with_store(store.clone())
        .with_emitter(Arc::new(NoopEmitter))
        .with_directory(directory.clone())
        .build()
        .unwrap();

    // Unanswered: recommended option, recorded as timed out
    let answer = coordinator
        .decide(&decision(), Some(Duration::from_millis(20)))
        .await
        .unwrap();
    assert_eq!(answer, "no");
    assert!(store.list_pending("conv-1").await.unwrap().is_empty());

    // Answered through the directory
    let waiting = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.decide(&decision(), None).await })
    };
    let pending = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let pending = store.list_pending("conv-1").await.unwrap();
            if !pending.is_empty() {
                break pending;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(directory.resolve_by_request_id(&pending[0].id, json!({"decision": "yes"})));
    assert_eq!(waiting.await.unwrap().unwrap(), "yes");

    let stored = store.get(&pending[0].id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Answered);
    assert_eq!(stored.response, Some(json!({"decision": "yes"})));
}
