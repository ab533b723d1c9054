use std::sync::Arc;
use strikeout::{
    AttemptOutcome, Decision, InMemoryAttemptStore, LastOutcome, PolicyError, ResourceId, ResourceRef,
    RetryEvaluator, RetryJobContext, RetryJobs, SkipReason,
};

fn failure() -> AttemptOutcome {
    AttemptOutcome::failure("gateway timeout")
}

#[tokio::test]
async fn resource_is_skipped_after_max_attempts() {
    let jobs = RetryJobs::new(InMemoryAttemptStore::new());
    let run = jobs.new_context("nightly", 3).unwrap();
    let ctx = run.context().clone();
    let ev = run.evaluator();
    let visit = ResourceId::from("visit-1");

    let outcomes = [failure(), failure(), AttemptOutcome::Success];
    for (expected, outcome) in (1..=3u64).zip(outcomes) {
        assert_eq!(ev.check_one(&ctx, &visit).await.unwrap(), Decision::Allow);
        let record = ev.record_outcome(&ctx, &visit, outcome).await.unwrap();
        assert_eq!(record.attempt_count, expected);
    }
    assert_eq!(ev.check_one(&ctx, &visit).await.unwrap(), Decision::Skip);
    assert_eq!(ev.attempts(&ctx, &visit).await.unwrap().last_outcome, LastOutcome::Success);
}

#[tokio::test]
async fn success_also_consumes_an_attempt() {
    let ev = RetryEvaluator::new(InMemoryAttemptStore::new());
    let ctx = RetryJobContext::new("job", 1).unwrap();
    let visit = ResourceId::from("v");
    ev.record_outcome(&ctx, &visit, AttemptOutcome::Success).await.unwrap();
    assert_eq!(ev.check_one(&ctx, &visit).await.unwrap(), Decision::Skip);
}

#[tokio::test]
async fn partition_keeps_order_and_reports_skips() {
    let ev = RetryEvaluator::new(InMemoryAttemptStore::new());
    let ctx = RetryJobContext::new("job", 3).unwrap();
    for (id, n) in [("A", 2), ("B", 3)] {
        for _ in 0..n {
            ev.record_outcome(&ctx, &ResourceId::from(id), failure()).await.unwrap();
        }
    }

    let resources = vec![ResourceRef::new("A", ()), ResourceRef::new("B", ()), ResourceRef::new("C", ())];
    let partition = ev.filter_eligible(&ctx, resources).await.unwrap();

    let eligible: Vec<_> = partition.eligible.iter().map(|r| r.id().as_str()).collect();
    assert_eq!(eligible, vec!["A", "C"]);
    assert_eq!(partition.skipped.len(), 1);
    assert_eq!(partition.report.entries[0].resource_id, ResourceId::from("B"));
    assert_eq!(partition.report.entries[0].reason, SkipReason::Exhausted { attempts: 3, max_attempts: 3 });
}

#[tokio::test]
async fn empty_collection_partitions_to_nothing() {
    let ev = RetryEvaluator::new(InMemoryAttemptStore::new());
    let ctx = RetryJobContext::new("job", 3).unwrap();
    let partition = ev.filter_eligible::<()>(&ctx, Vec::new()).await.unwrap();
    assert!(partition.eligible.is_empty());
    assert!(partition.report.is_empty());
}

#[test]
fn non_positive_max_attempts_is_rejected() {
    let store = Arc::new(InMemoryAttemptStore::new());
    let jobs = RetryJobs::from_shared(store.clone());
    assert!(matches!(jobs.new_context("job", 0), Err(PolicyError::InvalidMaxAttempts(0))));
    assert!(matches!(jobs.new_context("job", -4), Err(PolicyError::InvalidMaxAttempts(-4))));
    assert!(store.is_empty());
}

#[tokio::test]
async fn decisions_never_flip_back_to_allow() {
    let ev = RetryEvaluator::new(InMemoryAttemptStore::new());
    let ctx = RetryJobContext::new("job", 2).unwrap();
    let visit = ResourceId::from("v");
    let mut seen_skip = false;
    for _ in 0..6 {
        let decision = ev.check_one(&ctx, &visit).await.unwrap();
        if seen_skip {
            assert_eq!(decision, Decision::Skip);
        }
        seen_skip |= decision.is_skipped();
        ev.record_outcome(&ctx, &visit, failure()).await.unwrap();
    }
    assert!(seen_skip);
}

#[tokio::test]
async fn reads_do_not_change_counts() {
    let ev = RetryEvaluator::new(InMemoryAttemptStore::new());
    let ctx = RetryJobContext::new("job", 5).unwrap();
    let visit = ResourceId::from("v");
    ev.record_outcome(&ctx, &visit, failure()).await.unwrap();

    for _ in 0..4 {
        ev.check_one(&ctx, &visit).await.unwrap();
        ev.filter_eligible(&ctx, vec![ResourceRef::new("v", ())]).await.unwrap();
    }
    assert_eq!(ev.attempts(&ctx, &visit).await.unwrap().attempt_count, 1);
}

#[tokio::test]
async fn jobs_keep_separate_ledgers() {
    let jobs = RetryJobs::new(InMemoryAttemptStore::new());
    let monday = jobs.new_context("monday", 1).unwrap();
    let tuesday = jobs.new_context("tuesday", 1).unwrap();
    let visit = ResourceId::from("v");

    monday.evaluator().record_outcome(monday.context(), &visit, failure()).await.unwrap();
    assert_eq!(monday.evaluator().check_one(monday.context(), &visit).await.unwrap(), Decision::Skip);
    assert_eq!(tuesday.evaluator().check_one(tuesday.context(), &visit).await.unwrap(), Decision::Allow);
}
