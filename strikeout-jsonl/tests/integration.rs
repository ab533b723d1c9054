use strikeout::clock::ManualClock;
use strikeout::telemetry::{emit_best_effort, GateEvent};
use strikeout::{
    AttemptOutcome, AttemptStore, Decision, JobId, LastOutcome, ResourceId, RetryJobs, SkipReason,
};
use strikeout_jsonl::{JsonlAttemptStore, JsonlSink};

fn key() -> (JobId, ResourceId) {
    (JobId::from("nightly"), ResourceId::from("visit-1"))
}

#[tokio::test]
async fn ledger_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.jsonl");
    let (job, visit) = key();

    let clock = ManualClock::new(1_000);
    let store = JsonlAttemptStore::open_with_clock(&path, clock.clone()).await.unwrap();
    store.increment(&job, &visit, AttemptOutcome::failure("timeout")).await.unwrap();
    clock.advance(500);
    store.increment(&job, &visit, AttemptOutcome::failure("declined")).await.unwrap();
    drop(store);

    let reopened = JsonlAttemptStore::open(&path).await.unwrap();
    let record = reopened.get(&job, &visit).await.unwrap();
    assert_eq!(record.attempt_count, 2);
    assert_eq!(record.last_outcome, LastOutcome::Failure);
    assert_eq!(record.last_error.as_deref(), Some("declined"));
    assert_eq!(record.updated_at, Some(1_500));
}

#[tokio::test]
async fn replay_keeps_highest_count_and_skips_garbage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.jsonl");
    std::fs::write(
        &path,
        concat!(
            r#"{"job_id":"nightly","resource_id":"visit-1","attempt_count":2,"last_outcome":"failure","last_error":"x","updated_at":5}"#,
            "\n",
            "not json\n",
            r#"{"job_id":"nightly","resource_id":"visit-1","attempt_count":1,"last_outcome":"failure","last_error":"x","updated_at":4}"#,
            "\n",
        ),
    )
    .unwrap();

    let store = JsonlAttemptStore::open(&path).await.unwrap();
    let (job, visit) = key();
    assert_eq!(store.get(&job, &visit).await.unwrap().attempt_count, 2);
    let next = store.increment(&job, &visit, AttemptOutcome::Success).await.unwrap();
    assert_eq!(next.attempt_count, 3);
}

#[tokio::test]
async fn torn_last_line_is_dropped_before_appending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.jsonl");
    // A crash mid-append left half a line behind.
    std::fs::write(
        &path,
        concat!(
            r#"{"job_id":"nightly","resource_id":"visit-1","attempt_count":2,"last_outcome":"failure","last_error":"x","updated_at":5}"#,
            "\n",
            r#"{"job_id":"nightly","reso"#,
        ),
    )
    .unwrap();
    let (job, visit) = key();

    let store = JsonlAttemptStore::open(&path).await.unwrap();
    assert_eq!(store.increment(&job, &visit, AttemptOutcome::failure("timeout")).await.unwrap().attempt_count, 3);
    drop(store);

    let reopened = JsonlAttemptStore::open(&path).await.unwrap();
    assert_eq!(reopened.get(&job, &visit).await.unwrap().attempt_count, 3);
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 2);
    assert!(contents.ends_with('\n'));
}

#[tokio::test]
async fn whole_last_line_without_newline_is_kept() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.jsonl");
    std::fs::write(
        &path,
        r#"{"job_id":"nightly","resource_id":"visit-1","attempt_count":1,"last_outcome":"failure","last_error":"x","updated_at":5}"#,
    )
    .unwrap();
    let (job, visit) = key();

    let store = JsonlAttemptStore::open(&path).await.unwrap();
    assert_eq!(store.get(&job, &visit).await.unwrap().attempt_count, 1);
    store.increment(&job, &visit, AttemptOutcome::Success).await.unwrap();
    drop(store);

    let reopened = JsonlAttemptStore::open(&path).await.unwrap();
    let record = reopened.get(&job, &visit).await.unwrap();
    assert_eq!(record.attempt_count, 2);
    assert_eq!(record.last_outcome, LastOutcome::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_lose_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.jsonl");
    let store = std::sync::Arc::new(JsonlAttemptStore::open(&path).await.unwrap());
    let job = JobId::from("nightly");

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let store = store.clone();
        let job = job.clone();
        tasks.push(tokio::spawn(async move {
            let hot = ResourceId::from("hot");
            let own = ResourceId::new(format!("visit-{}", worker));
            for _ in 0..25 {
                store.increment(&job, &hot, AttemptOutcome::failure("busy")).await.unwrap();
                store.increment(&job, &own, AttemptOutcome::Success).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(store.get(&job, &ResourceId::from("hot")).await.unwrap().attempt_count, 200);
    let snapshot = store.snapshot(&job).await.unwrap();
    assert_eq!(snapshot.len(), 9);
    assert!(snapshot.iter().filter(|(r, _)| r.as_str() != "hot").all(|(_, rec)| rec.attempt_count == 25));
    drop(snapshot);
    drop(store);

    let reopened = JsonlAttemptStore::open(&path).await.unwrap();
    assert_eq!(reopened.get(&job, &ResourceId::from("hot")).await.unwrap().attempt_count, 200);
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 400);
    assert!(contents.lines().all(|l| serde_json::from_str::<serde_json::Value>(l).is_ok()));
}

#[tokio::test]
async fn gating_resumes_from_persisted_counts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.jsonl");
    let (_, visit) = key();

    {
        let jobs = RetryJobs::new(JsonlAttemptStore::open(&path).await.unwrap());
        let run = jobs.new_context("nightly", 2).unwrap();
        for _ in 0..2 {
            run.evaluator()
                .record_outcome(run.context(), &visit, AttemptOutcome::failure("timeout"))
                .await
                .unwrap();
        }
    }

    let jobs = RetryJobs::new(JsonlAttemptStore::open(&path).await.unwrap());
    let run = jobs.new_context("nightly", 2).unwrap();
    assert_eq!(run.evaluator().check_one(run.context(), &visit).await.unwrap(), Decision::Skip);
    let report = run.report().await.unwrap();
    assert_eq!(report.exhausted, vec![visit]);
}

#[tokio::test]
async fn open_fails_unavailable_for_unreadable_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    // A directory cannot be read as a ledger file.
    let err = JsonlAttemptStore::open(dir.path()).await.unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn sink_writes_json_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.jsonl");
    let sink = JsonlSink::new(path.to_string_lossy().to_string());
    let (job, visit) = key();

    emit_best_effort(
        sink.clone(),
        GateEvent::Skipped {
            job_id: job.clone(),
            resource_id: visit.clone(),
            reason: SkipReason::Exhausted { attempts: 3, max_attempts: 3 },
        },
    )
    .await;
    emit_best_effort(
        sink,
        GateEvent::Recorded { job_id: job, resource_id: visit, outcome: LastOutcome::Success, attempt_count: 1 },
    )
    .await;

    let contents = std::fs::read_to_string(&path).expect("file");
    let lines: Vec<serde_json::Value> =
        contents.lines().map(|l| serde_json::from_str(l).expect("json line")).collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["kind"], "skipped");
    assert_eq!(lines[1]["outcome"], "success");
    assert_eq!(lines[1]["attempt_count"], 1);
}
