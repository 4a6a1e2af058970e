//! Program runs against the flat-file response cache.

use std::sync::Arc;

use serde_json::json;
use spp_core::{
    CachedBackend, EvalConfig, Evaluator, FileCache, GenNode, LlmBackend, OfflineBackend, Program,
    ResponseCache, Row, ScriptedBackend,
};

fn rows() -> Vec<Row> {
    ["red", "green"]
        .iter()
        .map(|c| Row::from([("colour".to_string(), json!(c))]))
        .collect()
}

#[tokio::test]
async fn cache_file_replays_a_previous_run_offline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".spp").join("cache.jsonl");
    let program = Program::new(GenNode::new("Name a fruit that is {{colour}}."));

    {
        let live = Arc::new(ScriptedBackend::new(|request| {
            Ok(match request.last_user_message().unwrap_or_default() {
                m if m.contains("red") => "cherry".to_string(),
                _ => "lime".to_string(),
            })
        }));
        let cache: Arc<dyn ResponseCache> = Arc::new(FileCache::open(&path).unwrap());
        let backend: Arc<dyn LlmBackend> = Arc::new(CachedBackend::new(live.clone(), cache));
        let table = program
            .run(&Evaluator::new(backend, EvalConfig::default()), rows())
            .await
            .unwrap();
        assert_eq!(table.outputs(), vec![&json!("cherry"), &json!("lime")]);
        assert_eq!(live.calls(), 2);
    }

    let cache: Arc<dyn ResponseCache> = Arc::new(FileCache::open(&path).unwrap());
    assert_eq!(cache.stats().await.unwrap().entries, 2);
    let offline: Arc<dyn LlmBackend> = Arc::new(CachedBackend::new(Arc::new(OfflineBackend), cache));
    let evaluator = Evaluator::new(offline, EvalConfig::default());

    let replay = program.run(&evaluator, rows()).await.unwrap();
    assert_eq!(replay.outputs(), vec![&json!("cherry"), &json!("lime")]);

    let changed = Program::new(GenNode::new("Name a vegetable that is {{colour}}."));
    assert!(changed.run(&evaluator, rows()).await.is_err());
}
