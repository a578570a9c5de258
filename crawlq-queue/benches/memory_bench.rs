use crawlq_queue::{InMemoryTaskQueue, JsonSerializer, Task, TaskQueue, WorkerId};
use criterion::{criterion_group, criterion_main, Criterion};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

const TASK_COUNT: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BenchPayload {
    url: String,
    depth: u32,
}

fn payloads(count: usize) -> Vec<(BenchPayload, i64)> {
    (0..count)
        .map(|i| {
            let payload = BenchPayload {
                url: format!("https://bench-{}.test/page/{}", i % 17, i),
                depth: (i % 4) as u32,
            };
            (payload, (i % 10) as i64)
        })
        .collect()
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let data = payloads(TASK_COUNT);

    let mut group = c.benchmark_group("memory_enqueue");
    group.sample_size(10);
    group.bench_function("enqueue_1000", |b| {
        b.iter(|| {
            let queue = InMemoryTaskQueue::<BenchPayload, JsonSerializer>::new();
            rt.block_on(async {
                for (payload, priority) in &data {
                    let task = Task::new(payload.clone()).with_priority(*priority);
                    queue.enqueue(&task).await.unwrap();
                }
            });
        })
    });
    group.finish();
}

fn bench_lease_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let data = payloads(TASK_COUNT);
    let worker = WorkerId::new("bench");

    let mut group = c.benchmark_group("memory_lease");
    group.sample_size(10);
    group.bench_function("enqueue_lease_complete", |b| {
        b.iter(|| {
            let queue = InMemoryTaskQueue::<BenchPayload, JsonSerializer>::new();
            rt.block_on(async {
                for chunk in data.chunks(100) {
                    for (payload, priority) in chunk {
                        let task = Task::new(payload.clone()).with_priority(*priority);
                        queue.enqueue(&task).await.unwrap();
                    }
                    while let Some(task) = queue.lease_next(&worker).await.unwrap() {
                        queue
                            .complete(&task.task_id, &worker, serde_json::Value::Null)
                            .await
                            .unwrap();
                    }
                }
            });
        })
    });
    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_lease_cycle);
criterion_main!(benches);
