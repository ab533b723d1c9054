use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::Ready;
use strikeout::{
    AttemptOutcome, AttemptStore, InMemoryAttemptStore, JobId, ResourceBinding, ResourceId,
    ResourceRef, RetryJobContext, RetryJobs,
};
use tower::{Service, ServiceBuilder};

// Answers immediately, so only the gate itself is measured.
#[derive(Clone)]
struct EchoService;

impl Service<Step> for EchoService {
    type Response = ();
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Step) -> Self::Future {
        futures::future::ready(Ok(()))
    }
}

#[derive(Clone)]
struct Step {
    ctx: RetryJobContext,
    resource: ResourceId,
}

fn store_increment_hot_key(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryAttemptStore::new();
    let job = JobId::from("bench");
    let resource = ResourceId::from("hot");

    c.bench_function("store_increment_hot_key", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(store.increment(&job, &resource, AttemptOutcome::Success).await);
        });
    });
}

fn filter_eligible_1k(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let jobs = RetryJobs::new(InMemoryAttemptStore::new());
    let run = jobs.new_context("bench", 3).unwrap();
    rt.block_on(async {
        for i in (0..1_000).step_by(3) {
            for _ in 0..3 {
                let id = ResourceId::new(format!("r{}", i));
                let _ = run.evaluator().record_outcome(run.context(), &id, AttemptOutcome::failure("x")).await;
            }
        }
    });
    let batch: Vec<ResourceRef<()>> = (0..1_000).map(|i| ResourceRef::new(format!("r{}", i), ())).collect();

    c.bench_function("filter_eligible_1k", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(run.evaluator().filter_eligible(run.context(), batch.clone()).await);
        });
    });
}

fn reactive_gate_allow(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let jobs = RetryJobs::new(InMemoryAttemptStore::new());
    let run = jobs.new_context("bench", 3).unwrap();
    let layer = run
        .gate()
        .reactive(ResourceBinding::new(|s: &Step| s.ctx.clone(), |s: &Step| s.resource.clone()));
    let svc = ServiceBuilder::new().layer(layer).service(EchoService);
    let step = Step { ctx: run.context().clone(), resource: ResourceId::from("fresh") };

    c.bench_function("reactive_gate_allow", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box(step.clone()))).await;
        });
    });
}

criterion_group!(benches, store_increment_hot_key, filter_eligible_1k, reactive_gate_allow);
criterion_main!(benches);
