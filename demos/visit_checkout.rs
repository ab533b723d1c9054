//! Nightly checkout driver: a proactive batch filter plus a recorded per-visit step.
//!
//! Run with `RUST_LOG=strikeout=debug cargo run --example visit_checkout`.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strikeout::prelude::*;
use tower::{service_fn, Layer, ServiceExt};

#[derive(Clone)]
struct Checkout {
    ctx: RetryJobContext,
    visit: String,
}

struct Pass {
    ctx: RetryJobContext,
    visits: Vec<ResourceRef<String>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let jobs = RetryJobs::new(InMemoryAttemptStore::new());
    let run = jobs.start("nightly-checkout", &JobPolicy::new(3))?;
    let sink = MemorySink::new();
    let gate = run.gate().with_sink(sink.clone());

    // visit-2 fails twice before going through; visit-3 never does.
    let flaky = Arc::new(AtomicUsize::new(0));
    let checkout = gate
        .reactive_recorded(
            ResourceBinding::new(
                |c: &Checkout| c.ctx.clone(),
                |c: &Checkout| ResourceId::new(c.visit.clone()),
            )
            .operation("checkout"),
        )
        .layer(service_fn(move |c: Checkout| {
            let flaky = flaky.clone();
            async move {
                let failing = match c.visit.as_str() {
                    "visit-2" => flaky.fetch_add(1, Ordering::SeqCst) < 2,
                    "visit-3" => true,
                    _ => false,
                };
                if failing {
                    Err(std::io::Error::new(std::io::ErrorKind::Other, "payment gateway timeout"))
                } else {
                    Ok(format!("{} checked out", c.visit))
                }
            }
        }));

    let batch = gate.proactive(
        CollectionBinding::of_resources(|p: &Pass| p.ctx.clone(), |p: &mut Pass| &mut p.visits)
            .operation("checkout-pass"),
    );
    let pass_op = batch.layer(service_fn(move |pass: Pass| {
        let checkout = checkout.clone();
        async move {
            let mut done = Vec::new();
            for visit in pass.visits {
                let req = Checkout { ctx: pass.ctx.clone(), visit: visit.id().to_string() };
                match checkout.clone().oneshot(req).await {
                    Ok(Gated::Ran(msg)) => done.push(msg),
                    Ok(Gated::Skipped(_)) => {}
                    Err(err) => println!("  {}: {}", visit.id(), err),
                }
            }
            Ok::<_, std::io::Error>(done)
        }
    }));

    for pass in 1..=4 {
        let visits = (1..=3)
            .map(|i| ResourceRef::new(format!("visit-{}", i), format!("cart-{}", i)))
            .collect();
        let out = pass_op.clone().oneshot(Pass { ctx: run.context().clone(), visits }).await?;
        println!(
            "pass {}: {:?}, skipped {:?}",
            pass,
            out.response,
            out.skipped.resource_ids().map(ResourceId::as_str).collect::<Vec<_>>()
        );
    }

    let report = run.report().await?;
    println!("succeeded: {:?}", report.succeeded);
    println!("exhausted: {:?}", report.exhausted);
    println!("events: {}", sink.len());
    Ok(())
}
