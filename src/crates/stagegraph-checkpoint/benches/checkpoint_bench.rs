use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use stagegraph_checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
};

fn sample_state() -> serde_json::Value {
    json!({
        "workflow_id": "bench",
        "status": "text_written",
        "fields": {"text": "lorem ipsum ".repeat(200)},
        "audit_log": (0..50).map(|i| format!("[write] pass {}", i)).collect::<Vec<_>>(),
    })
}

fn memory_save_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryCheckpointStore::new();
    let state = sample_state();

    c.bench_function("memory save", |b| {
        b.to_async(&runtime).iter(|| async {
            let checkpoint = Checkpoint::new("bench", 1, state.clone());
            store.save("bench", black_box(checkpoint)).await.unwrap();
        });
    });
}

fn file_save_load_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    let store = runtime
        .block_on(FileCheckpointStore::open(dir.path()))
        .unwrap();
    let state = sample_state();

    c.bench_function("file save+load", |b| {
        b.to_async(&runtime).iter(|| async {
            let checkpoint = Checkpoint::new("bench", 1, state.clone());
            store.save("bench", checkpoint).await.unwrap();
            store.load(black_box("bench")).await.unwrap();
        });
    });
}

criterion_group!(benches, memory_save_benchmark, file_save_load_benchmark);
criterion_main!(benches);
