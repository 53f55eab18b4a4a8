use pretty_assertions::assert_eq;

use super::support::{harness, harness_with, FakePolicy};
use crate::error::HelmError;
use crate::session::manager::SessionEvent;
use crate::session::{BranchStatus, SessionStatus};

const PROJECT: &str = "/tmp/cchelm-p1";

#[tokio::test]
async fn test_create_fork_merge_flow() {
    let h = harness().await;
    let o = &h.orchestrator;

    o.projects.register(PROJECT, None).await.unwrap();
    let session = o
        .sessions
        .create_session(PROJECT, Some("s1".to_string()))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.main.status, BranchStatus::Active);
    assert!(session.forks.is_empty());
    assert_eq!(h.mux.pane_count(&session.mux_session_name), 1);

    // Fork off main.
    let fork = o
        .sessions
        .create_fork(&session.id, &session.main.id, "explore", false)
        .await
        .unwrap();
    assert_eq!(fork.parent_id.as_deref(), Some(session.main.id.as_str()));
    assert_eq!(h.mux.pane_count(&session.mux_session_name), 2);

    let reloaded = o.sessions.get_session(&session.id).await.unwrap();
    assert_eq!(reloaded.forks.len(), 1);

    // A second active fork from main violates the single-active-child
    // rule.
    let err = o
        .sessions
        .create_fork(&session.id, &session.main.id, "second", false)
        .await
        .unwrap_err();
    assert!(matches!(err, HelmError::Conflict(_)));

    // Drive the fork, then merge it back.
    o.mux.send_keys(&fork.mux_pane_id, "ls", true).await.unwrap();
    h.mux.set_screen(
        &fork.mux_pane_id,
        "ran ls\nsrc  Cargo.toml\nall done here\n❯ ",
    );

    let merged = o.sessions.merge_fork(&session.id, &fork.id).await.unwrap();
    assert_eq!(merged.status, BranchStatus::Merged);
    assert_eq!(h.mux.pane_count(&session.mux_session_name), 1);

    // The parent pane received one framed summary block.
    let sent = h.mux.sent_keys();
    let framed = sent
        .iter()
        .filter(|s| s.pane_id == session.main.mux_pane_id)
        .next_back()
        .expect("no keys sent to parent pane");
    assert!(framed.press_enter);
    assert!(framed.text.starts_with("[fork \"explore\" merged "));
    assert!(framed.text.contains("all done here"));
    assert!(framed.text.ends_with("[end fork \"explore\"]"));

    // Merged forks are terminal: not selectable, not re-mergeable.
    assert!(matches!(
        o.sessions.merge_fork(&session.id, &fork.id).await,
        Err(HelmError::Conflict(_))
    ));
    assert!(matches!(
        o.sessions.select_branch(&session.id, &fork.id).await,
        Err(HelmError::Conflict(_))
    ));

    // State on disk reflects the merge.
    let doc = o.store.load_state(PROJECT).await.unwrap().unwrap();
    assert_eq!(doc.sessions.len(), 1);
    assert_eq!(doc.sessions[0].forks[0].status, BranchStatus::Merged);
}

#[tokio::test]
async fn test_detach_and_resume_keeps_tree() {
    let h = harness_with(FakePolicy::waiting(), Some("sleep 30".to_string())).await;
    let o = &h.orchestrator;

    o.projects.register(PROJECT, None).await.unwrap();
    let session = o
        .sessions
        .create_session(PROJECT, Some("s1".to_string()))
        .await
        .unwrap();
    let port = session.viewer_port.expect("viewer port assigned");
    assert!((48100..=48180).contains(&port));

    let fork = o
        .sessions
        .create_fork(&session.id, &session.main.id, "explore", true)
        .await
        .unwrap();

    // Detach: viewer gone, port released, mux session still alive.
    let detached = o.sessions.detach_session(&session.id).await.unwrap();
    assert_eq!(detached.status, SessionStatus::Saved);
    assert_eq!(detached.viewer_port, None);
    assert!(!o.ports.is_reserved(port));
    assert!(o.mux.session_exists(&session.mux_session_name).await.unwrap());

    // Resume: port reassigned, identical branch tree, reconcile adds no
    // duplicates.
    let resumed = o.sessions.resume_session(PROJECT, &session.id).await.unwrap();
    assert_eq!(resumed.status, SessionStatus::Active);
    assert!(resumed.viewer_port.is_some());
    assert_eq!(resumed.forks.len(), 1);
    assert_eq!(resumed.main.id, session.main.id);
    assert_eq!(resumed.forks[0].id, fork.id);
    assert_eq!(resumed.forks[0].mux_pane_id, fork.mux_pane_id);

    o.viewers.stop_all().await;
}

#[tokio::test]
async fn test_drift_demotes_branch_and_frees_parent() {
    let h = harness().await;
    let o = &h.orchestrator;

    o.projects.register(PROJECT, None).await.unwrap();
    let session = o
        .sessions
        .create_session(PROJECT, Some("s1".to_string()))
        .await
        .unwrap();
    let fork = o
        .sessions
        .create_fork(&session.id, &session.main.id, "explore", false)
        .await
        .unwrap();

    // Someone kills the fork pane behind our back.
    h.mux.kill_pane_external(&fork.mux_pane_id);

    let reconciled = o.sessions.reconcile(&session.id).await.unwrap();
    assert_eq!(reconciled.forks[0].status, BranchStatus::Saved);

    // A drift event was recorded durably.
    let events: Vec<SessionEvent> = o
        .store
        .read_jsonl(&o.store.events_path(PROJECT), 100)
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == "drift" && e.branch_id.as_deref() == Some(fork.id.as_str())));

    // Parent is eligible for a fresh fork again.
    o.sessions
        .create_fork(&session.id, &session.main.id, "second", false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = harness().await;
    let o = &h.orchestrator;

    o.projects.register(PROJECT, None).await.unwrap();
    let session = o
        .sessions
        .create_session(PROJECT, Some("s1".to_string()))
        .await
        .unwrap();
    o.sessions
        .create_fork(&session.id, &session.main.id, "explore", false)
        .await
        .unwrap();

    let shape = |s: &crate::session::Session| -> Vec<(String, BranchStatus, String)> {
        s.branches()
            .map(|b| (b.id.clone(), b.status, b.mux_pane_id.clone()))
            .collect()
    };

    let first = o.sessions.reconcile(&session.id).await.unwrap();
    let second = o.sessions.reconcile(&session.id).await.unwrap();
    assert_eq!(shape(&first), shape(&second));

    let events: Vec<SessionEvent> = o
        .store
        .read_jsonl(&o.store.events_path(PROJECT), 100)
        .unwrap();
    assert!(!events.iter().any(|e| e.kind == "drift"));
}

#[tokio::test]
async fn test_reconcile_adopts_titled_panes_only() {
    let h = harness().await;
    let o = &h.orchestrator;

    o.projects.register(PROJECT, None).await.unwrap();
    let session = o
        .sessions
        .create_session(PROJECT, Some("s1".to_string()))
        .await
        .unwrap();

    // One pane following the title convention, one stranger.
    let adoptable = o
        .mux
        .split_pane(
            &session.main.mux_pane_id,
            false,
            std::path::Path::new(PROJECT),
            &[],
        )
        .await
        .unwrap();
    o.mux
        .set_pane_title(&adoptable, &crate::session::pane_title(&session.id, "orphan"))
        .await
        .unwrap();
    let stranger = o
        .mux
        .split_pane(
            &session.main.mux_pane_id,
            false,
            std::path::Path::new(PROJECT),
            &[],
        )
        .await
        .unwrap();
    o.mux.set_pane_title(&stranger, "htop").await.unwrap();

    let reconciled = o.sessions.reconcile(&session.id).await.unwrap();
    assert_eq!(reconciled.forks.len(), 1);
    assert_eq!(reconciled.forks[0].name, "orphan");
    assert_eq!(reconciled.forks[0].status, BranchStatus::Saved);

    let events: Vec<SessionEvent> = o
        .store
        .read_jsonl(&o.store.events_path(PROJECT), 100)
        .unwrap();
    assert!(events.iter().any(|e| e.kind == "adopted"));
    assert!(events
        .iter()
        .any(|e| e.kind == "warning" && e.message.contains("htop")));

    // Second pass changes nothing.
    let again = o.sessions.reconcile(&session.id).await.unwrap();
    assert_eq!(again.forks.len(), 1);
}

#[tokio::test]
async fn test_close_session_kills_everything() {
    let h = harness().await;
    let o = &h.orchestrator;

    o.projects.register(PROJECT, None).await.unwrap();
    let session = o
        .sessions
        .create_session(PROJECT, Some("s1".to_string()))
        .await
        .unwrap();
    o.sessions
        .create_fork(&session.id, &session.main.id, "explore", false)
        .await
        .unwrap();

    let closed = o.sessions.close_session(&session.id).await.unwrap();
    assert_eq!(closed.status, SessionStatus::Closed);
    assert_eq!(closed.main.status, BranchStatus::Closed);
    assert!(closed.forks.iter().all(|b| b.status == BranchStatus::Closed));
    assert_eq!(h.mux.session_count(), 0);

    // Terminal: resuming is a conflict.
    assert!(matches!(
        o.sessions.resume_session(PROJECT, &session.id).await,
        Err(HelmError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_export_writes_artifact_without_mutation() {
    let h = harness().await;
    let o = &h.orchestrator;

    o.projects.register(PROJECT, None).await.unwrap();
    let session = o
        .sessions
        .create_session(PROJECT, Some("s1".to_string()))
        .await
        .unwrap();
    let fork = o
        .sessions
        .create_fork(&session.id, &session.main.id, "explore", false)
        .await
        .unwrap();
    h.mux.set_screen(&fork.mux_pane_id, "transcript body here\n❯ ");

    let path = o
        .sessions
        .export_fork(&session.id, &fork.id, Some("snapshot".to_string()))
        .await
        .unwrap();
    assert!(path.ends_with("snapshot.log"));

    let body = std::fs::read_to_string(&path).unwrap();
    assert!(body.contains("# branch: explore"));
    assert!(body.contains("transcript body here"));

    let after = o.sessions.get_session(&session.id).await.unwrap();
    assert_eq!(after.forks[0].status, BranchStatus::Active);
}

#[tokio::test]
async fn test_recovery_rebuilds_from_disk() {
    let h = harness().await;
    let o = &h.orchestrator;

    o.projects.register(PROJECT, None).await.unwrap();
    let session = o
        .sessions
        .create_session(PROJECT, Some("s1".to_string()))
        .await
        .unwrap();
    let fork = o
        .sessions
        .create_fork(&session.id, &session.main.id, "explore", false)
        .await
        .unwrap();

    // A second orchestrator over the same storage root and the same
    // (still-running) mux: this is a process restart.
    let config = (*o.config).clone();
    let second = crate::orchestrator::Orchestrator::assemble(
        config,
        h.mux.clone(),
        h.policy.clone(),
        h.notifier.clone(),
    )
    .await
    .unwrap();
    second.recover().await.unwrap();

    let restored = second.sessions.get_session(&session.id).await.unwrap();
    assert_eq!(restored.status, SessionStatus::Active);
    assert_eq!(restored.forks.len(), 1);
    assert_eq!(restored.forks[0].id, fork.id);

    // Recovery plus reconcile created no duplicate branches.
    let doc = second.store.load_state(PROJECT).await.unwrap().unwrap();
    assert_eq!(doc.sessions[0].forks.len(), 1);
}

#[tokio::test]
async fn test_fork_on_unknown_project_or_session() {
    let h = harness().await;
    let o = &h.orchestrator;

    assert!(matches!(
        o.sessions.create_session(PROJECT, None).await,
        Err(HelmError::NotFound(_))
    ));

    o.projects.register(PROJECT, None).await.unwrap();
    assert!(matches!(
        o.sessions.create_fork("nope", "main", "x", false).await,
        Err(HelmError::NotFound(_))
    ));
}
