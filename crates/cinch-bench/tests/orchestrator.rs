//! Batch expansion, execution, and resume through the public API.

use cinch_bench::agent::artifact::{ArtifactStore, RunStatus};
use cinch_bench::agent::config::SessionConfig;
use cinch_bench::api::executor::CredentialPool;
use cinch_bench::run::resume::{ResumeScanner, ResumeState};
use cinch_bench::run::summary::BatchSummary;
use cinch_bench::run::tasks::{parse_declarations, plan};
use cinch_bench::run::Orchestrator;
use cinch_bench::{ApiError, ChatApi, ChatCompletion, ChatFuture, ChatRequest, exit_codes};
use std::sync::Arc;
use std::sync::Mutex;

/// Answers "42" and records the API key used for each request.
#[derive(Default)]
struct Answering {
    keys: Mutex<Vec<String>>,
}

impl Answering {
    fn calls(&self) -> usize {
        self.keys.lock().unwrap().len()
    }
}

impl ChatApi for Answering {
    fn chat<'a>(&'a self, _body: &'a ChatRequest, api_key: &'a str) -> ChatFuture<'a> {
        self.keys.lock().unwrap().push(api_key.to_string());
        Box::pin(async {
            Ok::<_, ApiError>(ChatCompletion {
                content: Some("The answer is 42.".into()),
                finish_reason: Some("stop".into()),
                ..Default::default()
            })
        })
    }
}

const SEEDED: &str = r#"[
  {"name": "arith", "env_class": "static_prompt",
   "env_params": {"prompt": "6 * 7?", "answer": "42", "seed": 1}},
  {"name": "arith", "env_class": "static_prompt",
   "env_params": {"prompt": "6 * 7?", "answer": "42", "seed": 2}}
]"#;

fn make_orchestrator(api: Arc<Answering>, dir: &std::path::Path) -> Orchestrator {
    Orchestrator::new(
        api,
        SessionConfig::default(),
        CredentialPool::from_csv("key-a,key-b").unwrap(),
        ArtifactStore::new(dir),
    )
    .with_workers(2)
}

#[tokio::test]
async fn seed_variants_run_once_each() {
    let tasks = plan(parse_declarations(SEEDED).unwrap(), 1);
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].config_id, tasks[1].config_id);

    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(Answering::default());
    let orch = make_orchestrator(api.clone(), dir.path());
    let outcome = orch.run(&tasks).await;

    assert_eq!(outcome.exit_code(), exit_codes::OK);
    assert_eq!(api.calls(), 2);

    // Credential offsets spread the two sessions over both keys.
    let mut keys = api.keys.lock().unwrap().clone();
    keys.sort();
    assert_eq!(keys, vec!["key-a", "key-b"]);

    let group = &outcome.summary.groups[&tasks[0].config_id];
    assert_eq!(group.runs, 2);
    assert_eq!(group.accuracy, Some(1.0));

    let seeds: Vec<_> = (0..2)
        .map(|i| orch.store().load(&tasks[0].config_id, i).unwrap().unwrap().seed)
        .collect();
    assert_eq!(seeds, vec![Some(1), Some(2)]);

    let on_disk: BatchSummary = serde_json::from_str(
        &std::fs::read_to_string(orch.store().summary_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(on_disk.overall.completed, 2);
}

#[tokio::test]
async fn resume_after_crash_reruns_only_the_unfinished_run() {
    let tasks = plan(parse_declarations(SEEDED).unwrap(), 3);
    assert_eq!(tasks.len(), 3);

    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(Answering::default());
    let orch = make_orchestrator(api.clone(), dir.path());
    assert_eq!(orch.run(&tasks).await.exit_code(), exit_codes::OK);
    assert_eq!(api.calls(), 3);

    // Simulate a crash mid-session for run 1.
    let store = orch.store();
    let config_id = &tasks[0].config_id;
    let mut crashed = store.load(config_id, 1).unwrap().unwrap();
    crashed.status = RunStatus::Running;
    crashed.completed = false;
    crashed.outcome = None;
    store.save(&crashed).unwrap();

    let sibling_before = std::fs::read_to_string(store.path(config_id, 0)).unwrap();

    let scanner = ResumeScanner::new(store);
    let plan = scanner.scan(&tasks);
    assert_eq!(plan.done(), 2);
    assert!(matches!(plan.entries[1].state, ResumeState::Failed { .. }));
    let pending = plan.to_run();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].run_id, 1);
    assert_eq!(scanner.scan(&tasks).to_run(), pending, "scan is idempotent");

    let outcome = orch.run(&tasks).await;
    assert_eq!(outcome.executed.len(), 1);
    assert_eq!(outcome.executed[0].run_id, 1);
    assert_eq!(outcome.already_done, 2);
    assert_eq!(api.calls(), 4);
    assert_eq!(outcome.exit_code(), exit_codes::OK);

    let sibling_after = std::fs::read_to_string(store.path(config_id, 0)).unwrap();
    assert_eq!(sibling_before, sibling_after, "completed sibling untouched");
    assert!(store.load(config_id, 1).unwrap().unwrap().completed);
}

#[tokio::test]
async fn truncated_artifact_counts_as_failed() {
    let tasks = plan(parse_declarations(SEEDED).unwrap(), 1);
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    let path = store.path(&tasks[0].config_id, 0);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, r#"{"config_id": "arith-"#).unwrap();

    let plan = ResumeScanner::new(&store).scan(&tasks);
    assert_eq!(plan.failed(), 1);
    assert_eq!(plan.never_started(), 1);

    let api = Arc::new(Answering::default());
    let outcome = make_orchestrator(api.clone(), dir.path()).run(&tasks).await;
    assert_eq!(outcome.executed.len(), 2);
    assert!(store.load(&tasks[0].config_id, 0).unwrap().unwrap().completed);
}
