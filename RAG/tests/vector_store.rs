mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn first_call_populates_and_persists() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("store");
    let embedder = Arc::new(HashEmbedder::default());
    let source = Arc::new(StaticSource::new(knowledge_base()));

    let store = accessor(&dir, embedder.clone(), source.clone())
        .get_vectorstore()
        .await
        .unwrap();

    assert_eq!(store.count().await, 3);
    assert_eq!(source.loads(), 1);
    assert!(dir.join("docs.json").exists());
    assert!(!dir.join("docs.json.tmp").exists());
}

#[tokio::test]
async fn populated_directory_is_loaded_without_fetching_or_embedding() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("store");

    let first_source = Arc::new(StaticSource::new(knowledge_base()));
    accessor(&dir, Arc::new(HashEmbedder::default()), first_source)
        .get_vectorstore()
        .await
        .unwrap();

    // a fresh process: new accessor, same directory
    let embedder = Arc::new(HashEmbedder::default());
    let source = Arc::new(StaticSource::new(knowledge_base()));
    let store = accessor(&dir, embedder.clone(), source.clone())
        .get_vectorstore()
        .await
        .unwrap();

    assert_eq!(store.count().await, 3);
    assert_eq!(source.loads(), 0);
    assert_eq!(embedder.document_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn store_is_opened_once_per_accessor() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(StaticSource::new(knowledge_base()));
    let accessor = accessor(tmp.path(), Arc::new(HashEmbedder::default()), source.clone());

    let a = accessor.get_vectorstore().await.unwrap();
    let b = accessor.get_vectorstore().await.unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(source.loads(), 1);
}

#[tokio::test]
async fn concurrent_first_callers_share_one_initialization() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("store");
    let source = Arc::new(StaticSource::new(knowledge_base()));
    let accessor = Arc::new(accessor(&dir, Arc::new(HashEmbedder::default()), source.clone()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let accessor = accessor.clone();
            tokio::spawn(async move { accessor.get_vectorstore().await.unwrap() })
        })
        .collect();

    let mut stores = Vec::new();
    for handle in handles {
        stores.push(handle.await.unwrap());
    }

    assert_eq!(source.loads(), 1);
    assert!(stores.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(stores[0].count().await, 3);
}

#[tokio::test]
async fn failed_fetch_leaves_nothing_behind_and_can_be_retried() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("store");
    let source = Arc::new(StaticSource::new(knowledge_base()));
    source.fail.store(true, Ordering::SeqCst);
    let accessor = accessor(&dir, Arc::new(HashEmbedder::default()), source.clone());

    let err = accessor.get_vectorstore().await.unwrap_err();
    assert!(format!("{:#}", err).contains("source unreachable"));
    assert!(!dir.join("docs.json").exists());

    source.fail.store(false, Ordering::SeqCst);
    let store = accessor.get_vectorstore().await.unwrap();
    assert_eq!(store.count().await, 3);
    assert_eq!(source.loads(), 2);
}

#[tokio::test]
async fn empty_source_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(StaticSource::new(Vec::new()));
    let accessor = accessor(tmp.path(), Arc::new(HashEmbedder::default()), source);

    assert!(accessor.get_vectorstore().await.is_err());
}

#[tokio::test]
async fn similarity_search_ranks_and_bounds_results() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(StaticSource::new(knowledge_base()));
    let store = accessor(tmp.path(), Arc::new(HashEmbedder::default()), source)
        .get_vectorstore()
        .await
        .unwrap();

    let hits = store
        .similarity_search("tomatoes watering gardening", 2)
        .await
        .unwrap();

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].metadata.source.as_deref(), Some("https://example.com/garden"));
    assert!(hits[0].score >= hits[1].score);

    assert!(store.similarity_search("anything", 0).await.unwrap().is_empty());
    assert_eq!(store.similarity_search("anything", 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn malformed_collection_file_is_an_error() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("docs.json"), b"{ not json").unwrap();
    let source = Arc::new(StaticSource::new(knowledge_base()));
    let accessor = accessor(tmp.path(), Arc::new(HashEmbedder::default()), source.clone());

    let err = accessor.get_vectorstore().await.unwrap_err();
    assert!(err.to_string().contains("malformed collection file"));
    assert_eq!(source.loads(), 0);
}

#[tokio::test]
async fn unfinished_write_is_discarded_and_rebuilt() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("docs.json.tmp"), b"{\"name\":\"docs\"").unwrap();
    let source = Arc::new(StaticSource::new(knowledge_base()));
    let accessor = accessor(tmp.path(), Arc::new(HashEmbedder::default()), source.clone());

    let store = accessor.get_vectorstore().await.unwrap();

    assert_eq!(store.count().await, 3);
    assert_eq!(source.loads(), 1);
    assert!(tmp.path().join("docs.json").exists());
    assert!(!tmp.path().join("docs.json.tmp").exists());

    let tool = rag_agent::RetrievalTool::new(Arc::new(accessor));
    let result = tool.retrieve("rust ownership").await;
    assert!(result.error.is_none());
    assert!(!result.citations.is_empty());
}

#[tokio::test]
async fn unrelated_files_do_not_count_as_a_populated_store() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("notes.txt"), b"stray").unwrap();
    std::fs::write(tmp.path().join("other.json"), b"{}").unwrap();
    let source = Arc::new(StaticSource::new(knowledge_base()));
    let accessor = accessor(tmp.path(), Arc::new(HashEmbedder::default()), source.clone());

    let store = accessor.get_vectorstore().await.unwrap();

    assert_eq!(store.count().await, 3);
    assert_eq!(source.loads(), 1);
}

#[tokio::test]
async fn empty_collection_file_is_rebuilt() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(
        tmp.path().join("docs.json"),
        br#"{"name":"docs","embedding_model":"hash-embedder","records":[]}"#,
    )
    .unwrap();
    let source = Arc::new(StaticSource::new(knowledge_base()));
    let accessor = accessor(tmp.path(), Arc::new(HashEmbedder::default()), source.clone());

    let store = accessor.get_vectorstore().await.unwrap();

    assert_eq!(store.count().await, 3);
    assert_eq!(source.loads(), 1);
}

#[tokio::test]
async fn debug_output_names_the_collection() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(StaticSource::new(knowledge_base()));
    let store = accessor(tmp.path(), Arc::new(HashEmbedder::default()), source)
        .get_vectorstore()
        .await
        .unwrap();

    let debug = format!("{:?}", store);
    assert!(debug.contains("\"docs\""));
    assert!(debug.contains("records: Some(3)"));
}
