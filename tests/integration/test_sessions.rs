#[path = "common.rs"]
mod common;

use common::{completion_capabilities, definition, eventually, registry, wait_for_state, Behavior, FakeFactory, FakeServer};
use futures::future::join_all;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lsp_hub::definition::{Document, DocumentSelector, RestartPolicy, ServerDefinition};
use lsp_hub::lsp::Capability;
use lsp_hub::session::{
    CancellationSupport, ChannelListener, LifecycleEvent, LifecycleManager, RequestFanout, SessionRegistry,
    SessionState,
};
use lsp_hub::HubError;

fn document(root: &Path, name: &str) -> Document {
    let path = root.join(name);
    std::fs::write(&path, "hello\n").unwrap();
    Document::new(path, root)
}

#[cfg(unix)]
#[tokio::test]
async fn test_process_that_exits_immediately_fails() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SessionRegistry::with_process_factory(Arc::new(LifecycleManager::new())));
    registry
        .register(
            ServerDefinition::new("broken", vec!["false".into()])
                .with_selector(DocumentSelector::patterns(&["*.txt"]).unwrap()),
        )
        .unwrap();
    let doc = document(dir.path(), "notes.txt");

    let sessions = registry.get_sessions(&doc, |_| true).await.unwrap();
    assert!(sessions.is_empty());

    let session = registry.session("broken", dir.path()).unwrap();
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.last_error().unwrap().contains("exited immediately"));
    assert_eq!(registry.failures("broken", dir.path()), 1);

    let scope = CancellationSupport::new();
    let result = RequestFanout::new(Arc::clone(&registry))
        .request(&doc, "textDocument/hover", json!({}), Duration::from_millis(200), &scope)
        .await
        .unwrap();
    assert!(result.is_empty());
    assert_eq!(scope.pending(), 0);
}

#[tokio::test]
async fn test_capability_predicate_filters_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory
        .add("with-completion", FakeServer::new(completion_capabilities()))
        .add("hover-only", FakeServer::new(json!({ "hoverProvider": true })));
    let registry = registry(&factory, vec![definition("with-completion"), definition("hover-only")]);
    let doc = document(dir.path(), "foo.txt");

    let sessions = registry.get_sessions(&doc, |caps| caps.supports(Capability::Completion)).await.unwrap();

    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].definition().id, "with-completion");
    // Both sessions were started; the other one is simply not selected.
    assert_eq!(registry.len(), 2);
    let hover = registry.session("hover-only", dir.path()).unwrap();
    assert_eq!(hover.state(), SessionState::Running);
}

#[tokio::test]
async fn test_non_matching_document_starts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("txt", FakeServer::new(completion_capabilities()));
    let registry = registry(&factory, vec![definition("txt")]);

    let sessions = registry.get_sessions(&document(dir.path(), "main.rs"), |_| true).await.unwrap();
    assert!(sessions.is_empty());
    assert_eq!(factory.starts("txt"), 0);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_concurrent_callers_share_one_session() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("txt", FakeServer::new(completion_capabilities()));
    let registry = registry(&factory, vec![definition("txt")]);
    let doc = document(dir.path(), "a.txt");

    let results = join_all((0..8).map(|_| registry.get_sessions(&doc, |_| true))).await;

    assert_eq!(factory.starts("txt"), 1);
    let ids: Vec<_> = results.into_iter().map(|r| r.unwrap()[0].id()).collect();
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(factory.count("txt", "initialize"), 1);
    assert!(eventually(|| factory.count("txt", "textDocument/didOpen") == 1).await);
}

#[tokio::test]
async fn test_document_opened_once_and_closed_on_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("txt", FakeServer::new(completion_capabilities()));
    let registry = registry(&factory, vec![definition("txt")]);
    let doc = document(dir.path(), "a.txt");

    registry.get_sessions(&doc, |_| true).await.unwrap();
    registry.get_sessions(&doc, |_| true).await.unwrap();
    assert!(eventually(|| factory.count("txt", "textDocument/didOpen") == 1).await);

    let opened = factory
        .received("txt")
        .into_iter()
        .find(|m| m["method"] == "textDocument/didOpen")
        .unwrap();
    assert_eq!(opened["params"]["textDocument"]["uri"], doc.uri());
    assert_eq!(opened["params"]["textDocument"]["text"], "hello\n");

    assert_eq!(registry.disconnect(&doc).await, 1);
    assert!(eventually(|| factory.count("txt", "textDocument/didClose") == 1).await);
    assert_eq!(registry.disconnect(&doc).await, 0);
}

#[tokio::test]
async fn test_initialize_carries_root_and_options() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("txt", FakeServer::new(completion_capabilities()));
    let mut txt = definition("txt");
    txt.initialization_options = Some(json!({ "validation": false }));
    let registry = registry(&factory, vec![txt]);

    registry.get_sessions(&document(dir.path(), "a.txt"), |_| true).await.unwrap();
    assert!(eventually(|| factory.received("txt").len() >= 3).await);

    let messages = factory.received("txt");
    let initialize = &messages[0];
    assert_eq!(initialize["method"], "initialize");
    assert_eq!(initialize["params"]["rootUri"], lsp_hub::workspace::file_uri(dir.path()));
    assert_eq!(initialize["params"]["initializationOptions"]["validation"], false);
    assert_eq!(messages[1]["method"], "initialized");
}

#[tokio::test]
async fn test_root_markers_pick_nested_project() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    std::fs::create_dir_all(project.join("src")).unwrap();
    std::fs::write(project.join("marker.toml"), "").unwrap();

    let factory = FakeFactory::new();
    factory.add("txt", FakeServer::new(completion_capabilities()));
    let mut txt = definition("txt");
    txt.root_markers = vec!["marker.toml".into()];
    let registry = registry(&factory, vec![txt]);

    let doc = document(&project.join("src"), "a.txt");
    let doc = Document { root: dir.path().to_path_buf(), ..doc };
    let sessions = registry.get_sessions(&doc, |_| true).await.unwrap();

    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].root(), project);
}

#[tokio::test]
async fn test_failed_start_is_retried_until_limit() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("flaky", FakeServer::new(json!({})).refusing_to_start());
    let flaky = definition("flaky").with_restart(RestartPolicy { max_attempts: 2, backoff_ms: 0, max_backoff_ms: 0 });
    let registry = registry(&factory, vec![flaky]);
    let doc = document(dir.path(), "a.txt");

    for attempt in 1..=2 {
        assert!(registry.get_sessions(&doc, |_| true).await.unwrap().is_empty());
        assert_eq!(factory.starts("flaky"), attempt);
        let session = registry.session("flaky", dir.path()).unwrap();
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.restart_count(), attempt as u32 - 1);
    }

    // Limit reached: no further process is created.
    assert!(registry.get_sessions(&doc, |_| true).await.unwrap().is_empty());
    assert_eq!(factory.starts("flaky"), 2);
    assert_eq!(registry.failures("flaky", dir.path()), 2);

    assert!(registry.reset("flaky", dir.path()));
    registry.get_sessions(&doc, |_| true).await.unwrap();
    assert_eq!(factory.starts("flaky"), 3);
}

#[tokio::test]
async fn test_backoff_delays_restart() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("flaky", FakeServer::new(json!({})).refusing_to_start());
    let flaky =
        definition("flaky").with_restart(RestartPolicy { max_attempts: 5, backoff_ms: 60_000, max_backoff_ms: 60_000 });
    let registry = registry(&factory, vec![flaky]);
    let doc = document(dir.path(), "a.txt");

    registry.get_sessions(&doc, |_| true).await.unwrap();
    registry.get_sessions(&doc, |_| true).await.unwrap();
    assert_eq!(factory.starts("flaky"), 1);
}

#[tokio::test]
async fn test_handshake_timeout_fails_session() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("mute", FakeServer::new(json!({})).initialize(Behavior::Never));
    let mut mute = definition("mute");
    mute.handshake_timeout_ms = 100;

    let lifecycle = Arc::new(LifecycleManager::new());
    let (listener, mut events) = ChannelListener::new();
    lifecycle.subscribe(Arc::new(listener));
    let registry = SessionRegistry::new(Arc::clone(&lifecycle), Arc::new(factory.clone()));
    registry.register(mute).unwrap();

    assert!(registry.get_sessions(&document(dir.path(), "a.txt"), |_| true).await.unwrap().is_empty());
    let session = registry.session("mute", dir.path()).unwrap();
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.last_error().unwrap().contains("no response within 100ms"));

    let mut names = Vec::new();
    while let Ok((_, event)) = events.try_recv() {
        if let LifecycleEvent::Initialized { error } = &event {
            assert!(error.is_some());
        }
        if !matches!(event, LifecycleEvent::MessageSent { .. } | LifecycleEvent::MessageReceived { .. }) {
            names.push(event.name());
        }
    }
    assert_eq!(names, vec!["starting", "started", "initialized", "stopped"]);
}

#[tokio::test]
async fn test_malformed_initialize_result_fails_session() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("odd", FakeServer::new(json!({})).initialize(Behavior::Respond(json!("ready"))));
    let registry = registry(&factory, vec![definition("odd")]);

    registry.get_sessions(&document(dir.path(), "a.txt"), |_| true).await.unwrap();
    let session = registry.session("odd", dir.path()).unwrap();
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.last_error().unwrap().contains("malformed initialize result"));
}

#[tokio::test]
async fn test_crash_fails_session_and_next_call_replaces_it() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("txt", FakeServer::new(completion_capabilities()).with("crash/now", Behavior::Crash));
    let registry = registry(&factory, vec![definition("txt")]);
    let doc = document(dir.path(), "a.txt");

    let first = registry.get_sessions(&doc, |_| true).await.unwrap().remove(0);
    let err = first.request("crash/now", None).await.unwrap_err();
    assert!(matches!(err, HubError::ServerUnavailable { .. }), "{err}");
    wait_for_state(&registry, "txt", dir.path(), SessionState::Failed).await;
    assert!(first.request("textDocument/hover", None).await.is_err());

    let second = registry.get_sessions(&doc, |_| true).await.unwrap().remove(0);
    assert_ne!(first.id(), second.id());
    assert_eq!(second.state(), SessionState::Running);
    assert_eq!(second.restart_count(), 1);
    assert_eq!(factory.starts("txt"), 2);
}

#[tokio::test]
async fn test_crash_loop_stops_at_restart_limit() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("crashy", FakeServer::new(completion_capabilities()).with("crash/now", Behavior::Crash));
    let crashy = definition("crashy").with_restart(RestartPolicy { max_attempts: 2, backoff_ms: 0, max_backoff_ms: 0 });
    let registry = registry(&factory, vec![crashy]);
    let doc = document(dir.path(), "a.txt");

    // Every start completes the handshake, then dies on the first request.
    let mut restart_counts = Vec::new();
    for _ in 0..5 {
        let Some(session) = registry.get_sessions(&doc, |_| true).await.unwrap().pop() else {
            continue;
        };
        restart_counts.push(session.restart_count());
        assert!(session.request("crash/now", None).await.is_err());
        wait_for_state(&registry, "crashy", dir.path(), SessionState::Failed).await;
    }

    assert_eq!(restart_counts, vec![0, 1]);
    assert_eq!(factory.starts("crashy"), 2);
    assert_eq!(registry.failures("crashy", dir.path()), 2);

    assert!(registry.reset("crashy", dir.path()));
    assert_eq!(registry.get_sessions(&doc, |_| true).await.unwrap().len(), 1);
    assert_eq!(factory.starts("crashy"), 3);
}

#[tokio::test]
async fn test_shutdown_all_stops_sessions_and_publishes_events() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("txt", FakeServer::new(completion_capabilities()));

    let lifecycle = Arc::new(LifecycleManager::new());
    let (listener, mut events) = ChannelListener::new();
    lifecycle.subscribe(Arc::new(listener));
    let registry = SessionRegistry::new(Arc::clone(&lifecycle), Arc::new(factory.clone()));
    registry.register(definition("txt")).unwrap();

    let session = registry.get_sessions(&document(dir.path(), "a.txt"), |_| true).await.unwrap().remove(0);
    assert_eq!(registry.shutdown_all().await, 1);

    assert_eq!(session.state(), SessionState::Stopped);
    assert!(session.last_error().is_none());
    assert!(registry.is_empty());
    assert!(lifecycle.is_disposed());
    assert_eq!(factory.count("txt", "shutdown"), 1);
    assert_eq!(factory.count("txt", "exit"), 1);

    let mut names = Vec::new();
    let mut saw_traffic = false;
    while let Ok((snapshot, event)) = events.try_recv() {
        assert_eq!(snapshot.id, session.id());
        match event {
            LifecycleEvent::MessageSent { .. } | LifecycleEvent::MessageReceived { .. } => saw_traffic = true,
            other => names.push(other.name()),
        }
    }
    assert!(saw_traffic);
    assert_eq!(names, vec!["starting", "started", "initialized", "stopping", "stopped"]);
}

#[tokio::test]
async fn test_stop_idle_and_shutdown_root() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("txt", FakeServer::new(completion_capabilities()));
    let registry = registry(&factory, vec![definition("txt")]);

    registry.get_sessions(&document(first.path(), "a.txt"), |_| true).await.unwrap();
    registry.get_sessions(&document(second.path(), "b.txt"), |_| true).await.unwrap();
    assert_eq!(registry.len(), 2);

    assert_eq!(registry.stop_idle(Duration::from_secs(3600)).await, 0);
    assert_eq!(registry.shutdown_root(first.path()).await, 1);
    assert_eq!(registry.len(), 1);
    assert!(registry.session("txt", first.path()).is_none());

    assert_eq!(registry.stop_idle(Duration::ZERO).await, 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_requests_need_a_running_session() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("txt", FakeServer::new(completion_capabilities()));
    let registry = registry(&factory, vec![definition("txt")]);

    let session = registry.get_sessions(&document(dir.path(), "a.txt"), |_| true).await.unwrap().remove(0);
    session.shutdown().await;

    let err = session.request("textDocument/hover", None).await.unwrap_err();
    assert!(matches!(err, HubError::ServerUnavailable { .. }));
    // Stopped sessions never start again.
    session.start(&factory).await.unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
}
