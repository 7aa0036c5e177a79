mod common;

use common::{bash_asks, recording_manager, wait_for_pending};
use serde_json::json;
use std::time::Duration;
use tollgate_core::permission::{AskRequest, PermissionError, Reply};
use tollgate_core::rules::{evaluate, Action, Mode, Ruleset};

#[tokio::test]
async fn test_reject_cascades_through_session() {
    let (manager, recorder) = recording_manager(bash_asks());

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.ask(AskRequest::new("s1", "bash", ["rm -rf /"])).await })
    };
    let second = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.ask(AskRequest::new("s1", "bash", ["curl x"])).await })
    };
    let other_session = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.ask(AskRequest::new("s2", "bash", ["ls"])).await })
    };

    wait_for_pending(&manager, "s1", 2).await;
    wait_for_pending(&manager, "s2", 1).await;

    let target = manager
        .list_pending(Some("s1"))
        .into_iter()
        .find(|p| p.patterns == ["rm -rf /"])
        .unwrap();
    manager
        .reply(&target.id, Reply::Reject, Some("not on my machine".into()))
        .await
        .unwrap();

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        PermissionError::Rejected { message: Some(ref m), .. } if m == "not on my machine"
    ));
    assert!(matches!(
        second.await.unwrap().unwrap_err(),
        PermissionError::Rejected { .. }
    ));
    assert_eq!(manager.pending_count("s1"), 0);

    // Other sessions are untouched
    assert_eq!(manager.pending_count("s2"), 1);
    let replied = recorder.events_of_type("permission_replied");
    assert_eq!(replied.len(), 2);
    assert!(replied.iter().all(|e| e.payload["reply"] == "reject"));
    assert!(replied.iter().all(|e| e.payload["sessionId"] == "s1"));

    manager.cancel_all("s2").await;
    assert!(other_session.await.unwrap().is_err());
}

#[tokio::test]
async fn test_always_auto_approves_matching_requests() {
    let (manager, recorder) = recording_manager(bash_asks());

    let status = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .ask(AskRequest::new("s1", "bash", ["git status"]).with_always(["git *"]))
                .await
        })
    };
    wait_for_pending(&manager, "s1", 1).await;
    let log = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.ask(AskRequest::new("s1", "bash", ["git log"])).await })
    };
    let npm = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.ask(AskRequest::new("s1", "bash", ["npm install"])).await })
    };
    wait_for_pending(&manager, "s1", 3).await;

    let target = manager
        .list_pending(Some("s1"))
        .into_iter()
        .find(|p| p.patterns == ["git status"])
        .unwrap();
    manager.reply(&target.id, Reply::Always, None).await.unwrap();

    status.await.unwrap().unwrap();
    log.await.unwrap().unwrap();

    // Unrelated request still waits
    assert_eq!(manager.pending_count("s1"), 1);
    assert_eq!(manager.list_pending(Some("s1"))[0].patterns, vec!["npm install"]);

    let replied = recorder.events_of_type("permission_replied");
    assert_eq!(replied.len(), 2);
    let auto: Vec<_> = replied
        .iter()
        .filter(|e| e.payload["autoApproved"] == true)
        .collect();
    assert_eq!(auto.len(), 1);
    assert_eq!(auto[0].payload["reply"], "always");

    // Later asks in the same class no longer suspend
    manager
        .ask(AskRequest::new("s1", "bash", ["git diff"]))
        .await
        .unwrap();

    manager.cancel_all("s1").await;
    assert!(npm.await.unwrap().is_err());
}

#[tokio::test]
async fn test_always_needs_every_pattern_to_auto_approve() {
    let (manager, recorder) = recording_manager(bash_asks());

    let both = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.ask(AskRequest::new("s1", "bash", ["ls", "pwd"])).await })
    };
    wait_for_pending(&manager, "s1", 1).await;
    let listing = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .ask(AskRequest::new("s1", "bash", ["ls -la"]).with_always(["ls*"]))
                .await
        })
    };
    wait_for_pending(&manager, "s1", 2).await;

    let pending = manager.list_pending(Some("s1"));
    let multi = pending.iter().find(|p| p.patterns.len() == 2).unwrap();
    assert_eq!(multi.patterns, vec!["ls", "pwd"]);
    let target = pending.iter().find(|p| p.patterns == ["ls -la"]).unwrap();
    manager.reply(&target.id, Reply::Always, None).await.unwrap();
    listing.await.unwrap().unwrap();

    // "pwd" still asks, so the two-pattern request keeps waiting
    assert_eq!(manager.evaluate("bash", "ls"), Action::Allow);
    assert_eq!(manager.pending_count("s1"), 1);
    let auto = recorder
        .events_of_type("permission_replied")
        .into_iter()
        .filter(|e| e.payload["autoApproved"] == true)
        .count();
    assert_eq!(auto, 0);

    manager.cancel_all("s1").await;
    assert!(both.await.unwrap().is_err());
}

#[tokio::test]
async fn test_always_combines_with_earlier_approvals() {
    let rules = Ruleset::from_entries([
        ("*", "*", Action::Allow),
        ("bash", "*", Action::Ask),
        ("read", "*.env", Action::Ask),
    ])
    .unwrap();
    let (manager, _recorder) = recording_manager(rules);

    // First approval: cargo commands
    let cargo = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .ask(AskRequest::new("s1", "bash", ["cargo build"]).with_always(["cargo *"]))
                .await
        })
    };
    wait_for_pending(&manager, "s1", 1).await;
    let id = manager.list_pending(Some("s1"))[0].id.clone();
    manager.reply(&id, Reply::Always, None).await.unwrap();
    cargo.await.unwrap().unwrap();

    // A pending read is unaffected by an approval for a different permission
    let read = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.ask(AskRequest::new("s1", "read", [".env"])).await })
    };
    let test = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .ask(AskRequest::new("s1", "bash", ["make test"]).with_always(["make *"]))
                .await
        })
    };
    wait_for_pending(&manager, "s1", 2).await;

    let make = manager
        .list_pending(Some("s1"))
        .into_iter()
        .find(|p| p.permission == "bash")
        .unwrap();
    manager.reply(&make.id, Reply::Always, None).await.unwrap();
    test.await.unwrap().unwrap();

    assert_eq!(manager.pending_count("s1"), 1);
    assert_eq!(manager.approved_rules().len(), 2);
    assert_eq!(manager.evaluate("bash", "cargo test"), Action::Allow);
    assert_eq!(manager.evaluate("bash", "make lint"), Action::Allow);

    manager.cancel_all("s1").await;
    assert!(read.await.unwrap().is_err());
}

#[tokio::test]
async fn test_each_suspension_gets_its_own_id() {
    let (manager, recorder) = recording_manager(bash_asks());

    let handle = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .ask(
                    AskRequest::new("s1", "bash", ["ls", "pwd"])
                        .with_metadata(json!({"tool": "bash", "call": 7})),
                )
                .await
        })
    };

    let first = recorder
        .wait_for("permission_asked", 1, Duration::from_secs(2))
        .await;
    let first_id = first[0].request_id().unwrap().to_string();
    assert_eq!(first[0].payload["patterns"], json!(["ls", "pwd"]));
    assert_eq!(first[0].payload["metadata"]["call"], 7);
    manager.reply(&first_id, Reply::Once, None).await.unwrap();

    let both = recorder
        .wait_for("permission_asked", 2, Duration::from_secs(2))
        .await;
    let second_id = both[1].request_id().unwrap().to_string();
    assert_ne!(first_id, second_id);
    assert_eq!(both[1].payload["patterns"], json!(["ls", "pwd"]));
    assert!(first_id.starts_with("per_"));

    // Only one ask outstanding per call
    assert_eq!(manager.pending_count("s1"), 1);
    manager.reply(&second_id, Reply::Once, None).await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_deny_after_approved_pattern_stops_the_call() {
    let rules = Ruleset::from_entries([
        ("*", "*", Action::Allow),
        ("bash", "*", Action::Ask),
        ("bash", "rm *", Action::Deny),
    ])
    .unwrap();
    let (manager, recorder) = recording_manager(rules);

    let handle = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .ask(AskRequest::new("s1", "bash", ["ls", "rm -rf /", "pwd"]))
                .await
        })
    };

    let asked = recorder
        .wait_for("permission_asked", 1, Duration::from_secs(2))
        .await;
    manager
        .reply(asked[0].request_id().unwrap(), Reply::Once, None)
        .await
        .unwrap();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, PermissionError::Denied { ref pattern, .. } if pattern == "rm -rf /"));
    assert_eq!(recorder.events_of_type("permission_asked").len(), 1);
}

#[tokio::test]
async fn test_explore_mode_never_asks() {
    let (manager, recorder) = recording_manager(Ruleset::default_base());
    manager.set_mode(Mode::Explore);

    for (permission, target) in [
        ("clarification", "*"),
        ("bash", "ls"),
        ("edit", "src/lib.rs"),
        ("external_directory", "/etc"),
    ] {
        let err = manager
            .ask(AskRequest::new("sub-agent", permission, [target]))
            .await
            .unwrap_err();
        assert!(err.is_denial(), "{permission} should be denied");
    }
    manager
        .ask(AskRequest::new("sub-agent", "read", ["src/lib.rs"]))
        .await
        .unwrap();
    assert!(recorder.events().is_empty());
}

#[tokio::test]
async fn test_announce_failure_leaves_nothing_pending() {
    use std::sync::Arc;
    use tollgate_core::permission::PermissionManager;
    use tollgate_core::test_utils::RecordingEmitter;

    let recorder = Arc::new(RecordingEmitter::failing_first(1));
    let manager = PermissionManager::builder()
        .with_base_rules(bash_asks())
        .with_emitter(recorder.clone())
        .build();

    let err = manager
        .ask(AskRequest::new("s1", "bash", ["ls"]))
        .await
        .unwrap_err();
    assert!(matches!(err, PermissionError::Announce(_)));
    assert_eq!(manager.pending_count("s1"), 0);
    assert!(manager.list_pending(None).is_empty());
}

#[test]
fn test_layering_equals_concatenation() {
    let layers = [
        Ruleset::from_entries([("*", "*", Action::Allow), ("bash", "*", Action::Ask)]).unwrap(),
        Ruleset::from_entries([("bash", "git *", Action::Allow), ("read", "*.env", Action::Deny)])
            .unwrap(),
        Ruleset::from_entries([("bash", "git push*", Action::Ask), ("*", "*.env", Action::Ask)])
            .unwrap(),
    ];
    let concatenated: Ruleset = layers.iter().flat_map(|l| l.iter().cloned()).collect();

    let probes = [
        ("bash", "ls"),
        ("bash", "git status"),
        ("bash", "git push origin"),
        ("read", "prod.env"),
        ("read", "main.rs"),
        ("edit", "x.env"),
        ("unknown", "thing"),
    ];
    for (permission, target) in probes {
        let layered = evaluate(permission, target, &[&layers[0], &layers[1], &layers[2]]);
        let flat = evaluate(permission, target, &[&concatenated]);
        assert_eq!(layered, flat, "{permission} {target}");
    }

    // A later exception outranks an earlier ask
    let mut rules = Ruleset::from_entries([("*", "*", Action::Allow), ("read", "*.env", Action::Ask)])
        .unwrap();
    assert_eq!(evaluate("read", "secrets.env", &[&rules]).action(), Action::Ask);
    rules.extend(Ruleset::from_entries([("read", "*.env.example", Action::Allow)]).unwrap().iter().cloned());
    assert_eq!(evaluate("read", "app.env.example", &[&rules]).action(), Action::Allow);
}
