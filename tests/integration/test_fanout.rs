#[path = "common.rs"]
mod common;

use common::{completion_capabilities, definition, eventually, registry, Behavior, FakeFactory, FakeServer};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lsp_hub::definition::Document;
use lsp_hub::lsp::Capability;
use lsp_hub::session::{CancellationSupport, LanguageServerSession, RequestFanout, SessionState};
use lsp_hub::HubError;

const CODE_LENS: &str = "textDocument/codeLens";

fn document(root: &Path) -> Document {
    let path = root.join("notes.txt");
    std::fs::write(&path, "{#for item in items}\n").unwrap();
    Document::new(path, root)
}

fn lens(title: &str) -> Value {
    json!([{ "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } },
             "command": { "title": title, "command": "noop" } }])
}

fn params(document: &Document) -> Value {
    json!({ "textDocument": { "uri": document.uri() } })
}

#[tokio::test]
async fn test_slow_server_is_left_out_at_the_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory
        .add("fast", FakeServer::new(completion_capabilities()).with(CODE_LENS, Behavior::Delay(Duration::from_millis(50), lens("fast"))))
        .add("slow", FakeServer::new(completion_capabilities()).with(CODE_LENS, Behavior::Never));
    let registry = registry(&factory, vec![definition("fast"), definition("slow")]);
    let doc = document(dir.path());
    let scope = CancellationSupport::new();

    let started = Instant::now();
    let result = RequestFanout::new(Arc::clone(&registry))
        .request(&doc, CODE_LENS, params(&doc), Duration::from_millis(200), &scope)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.matched, 2);
    assert_eq!(result.contributions.len(), 1);
    assert_eq!(result.contributions[0].session.definition_id, "fast");
    assert_eq!(result.contributions[0].value[0]["command"]["title"], "fast");
    assert_eq!(result.timed_out, 1);

    // Missing the deadline does not take the session down.
    assert_eq!(registry.session("slow", dir.path()).unwrap().state(), SessionState::Running);
}

#[tokio::test]
async fn test_failures_do_not_spoil_other_contributions() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory
        .add("a", FakeServer::new(completion_capabilities()).with(CODE_LENS, Behavior::Respond(lens("a"))))
        .add("broken", FakeServer::new(completion_capabilities()).with(CODE_LENS, Behavior::Error(-32603, "boom".into())))
        .add("b", FakeServer::new(completion_capabilities()).with(CODE_LENS, Behavior::Respond(lens("b"))))
        .add("gone", FakeServer::new(completion_capabilities()).with(CODE_LENS, Behavior::Never));
    let registry = registry(&factory, vec![definition("a"), definition("broken"), definition("b"), definition("gone")]);
    let doc = document(dir.path());

    let result = RequestFanout::new(registry)
        .request(&doc, CODE_LENS, params(&doc), Duration::from_millis(300), &CancellationSupport::new())
        .await
        .unwrap();

    assert_eq!(result.matched, 4);
    assert_eq!(result.failed, 1);
    assert_eq!(result.timed_out, 1);
    let sources: Vec<_> = result.contributions.iter().map(|c| c.session.definition_id.as_str()).collect();
    assert_eq!(sources, vec!["a", "b"]);
}

#[tokio::test]
async fn test_contributions_follow_resolution_order() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory
        .add("first", FakeServer::new(completion_capabilities()).with(CODE_LENS, Behavior::Delay(Duration::from_millis(80), lens("first"))))
        .add("second", FakeServer::new(completion_capabilities()).with(CODE_LENS, Behavior::Respond(lens("second"))));
    let registry = registry(&factory, vec![definition("first"), definition("second")]);
    let doc = document(dir.path());

    let result = RequestFanout::new(registry)
        .request(&doc, CODE_LENS, params(&doc), Duration::from_secs(2), &CancellationSupport::new())
        .await
        .unwrap();

    let titles: Vec<_> = result.values().map(|v| v[0]["command"]["title"].clone()).collect();
    assert_eq!(titles, vec![json!("first"), json!("second")]);
}

#[tokio::test]
async fn test_empty_answers_are_not_contributions() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory
        .add("null", FakeServer::new(completion_capabilities()).with(CODE_LENS, Behavior::Respond(Value::Null)))
        .add("empty", FakeServer::new(completion_capabilities()).with(CODE_LENS, Behavior::Respond(json!([]))));
    let registry = registry(&factory, vec![definition("null"), definition("empty")]);
    let doc = document(dir.path());

    let result = RequestFanout::new(registry)
        .request(&doc, CODE_LENS, params(&doc), Duration::from_secs(2), &CancellationSupport::new())
        .await
        .unwrap();

    assert!(result.is_empty());
    assert_eq!(result.matched, 2);
    assert_eq!(result.empty, 2);
    assert_eq!(result.failed, 0);
}

#[tokio::test]
async fn test_request_only_reaches_capable_servers() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory
        .add("complete", FakeServer::new(completion_capabilities()).with("textDocument/completion", Behavior::Respond(json!({ "items": [{ "label": "for" }] }))))
        .add("plain", FakeServer::new(json!({ "hoverProvider": true })));
    let registry = registry(&factory, vec![definition("complete"), definition("plain")]);
    let doc = document(dir.path());

    let result = RequestFanout::new(registry)
        .request(&doc, "textDocument/completion", params(&doc), Duration::from_secs(2), &CancellationSupport::new())
        .await
        .unwrap();

    assert_eq!(result.matched, 1);
    assert_eq!(result.contributions[0].value["items"][0]["label"], "for");
    assert_eq!(factory.count("plain", "textDocument/completion"), 0);
}

#[tokio::test]
async fn test_typed_fanout_with_custom_request() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory
        .add("a", FakeServer::new(completion_capabilities()).with("qute/templates", Behavior::Respond(json!(["a.html", "b.html"]))))
        .add("b", FakeServer::new(completion_capabilities()).with("qute/templates", Behavior::Respond(json!(["c.html"]))));
    let registry = registry(&factory, vec![definition("a"), definition("b")]);
    let doc = document(dir.path());

    let result = RequestFanout::new(registry)
        .fanout(
            &doc,
            |caps| caps.supports(Capability::Completion),
            |session: Arc<LanguageServerSession>| async move {
                let value = session.request("qute/templates", None).await?;
                Ok::<_, HubError>(value.and_then(|v| serde_json::from_value::<Vec<String>>(v).ok()))
            },
            Duration::from_secs(2),
            &CancellationSupport::new(),
        )
        .await
        .unwrap();

    let templates: Vec<String> = result.into_values().into_iter().flatten().collect();
    assert_eq!(templates, vec!["a.html", "b.html", "c.html"]);
}

#[tokio::test]
async fn test_cancelling_the_scope_aborts_the_fanout() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("stuck", FakeServer::new(completion_capabilities()).with(CODE_LENS, Behavior::Never));
    let registry = registry(&factory, vec![definition("stuck")]);
    let doc = document(dir.path());
    let scope = CancellationSupport::new();

    tokio::spawn({
        let scope = scope.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            scope.cancel_all();
        }
    });

    let started = Instant::now();
    let err = RequestFanout::new(Arc::clone(&registry))
        .request(&doc, CODE_LENS, params(&doc), Duration::from_secs(10), &scope)
        .await
        .unwrap_err();

    assert!(matches!(err, HubError::OperationCancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(eventually(|| scope.pending() == 0).await);
    // The abandoned request is cancelled on the server as well.
    assert!(eventually(|| factory.count("stuck", "$/cancelRequest") == 1).await);
    assert_eq!(registry.session("stuck", dir.path()).unwrap().state(), SessionState::Running);
}

#[tokio::test]
async fn test_cancelled_scope_rejects_new_fanouts() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("a", FakeServer::new(completion_capabilities()));
    let registry = registry(&factory, vec![definition("a")]);
    let scope = CancellationSupport::new();
    scope.cancel_all();

    let doc = document(dir.path());
    let err = RequestFanout::new(registry)
        .request(&doc, CODE_LENS, params(&doc), Duration::from_secs(1), &scope)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::OperationCancelled));
    assert_eq!(factory.starts("a"), 0);
}

#[tokio::test]
async fn test_server_side_cancellation_counts_as_failure() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    factory.add("busy", FakeServer::new(completion_capabilities()).with(CODE_LENS, Behavior::Error(-32800, "cancelled".into())));
    let registry = registry(&factory, vec![definition("busy")]);
    let doc = document(dir.path());

    let result = RequestFanout::new(registry)
        .request(&doc, CODE_LENS, params(&doc), Duration::from_secs(1), &CancellationSupport::new())
        .await
        .unwrap();
    assert!(result.is_empty());
    assert_eq!(result.failed, 1);
}
