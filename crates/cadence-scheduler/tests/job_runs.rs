mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use cadence_core::config::{CacheKind, PersistencePolicy};
use cadence_scheduler::{JobDb, JobType, NewJob, RemoteProperties, SchedulerError};
use chrono::Duration;
use common::*;

#[tokio::test]
async fn failed_attempts_are_retried_and_counted() {
    for kind in KINDS {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("attempts");
        let (cache, _, _) = manual_cache(kind, PersistencePolicy::Transactional);
        let mut rx = cache.subscribe();

        let job = cache
            .add_job(NewJob {
                retries: 2,
                ..local("flaky", &format!("{}; exit 1", append(&out, "try")))
            })
            .unwrap();
        let stat = next_run_of(&mut rx, job.id()).await;

        assert!(!stat.success);
        assert_eq!(stat.number_of_retries, 2);
        assert_eq!(lines(&out).len(), 3);
        let meta = job.metadata();
        assert_eq!(meta.error_count, 3);
        assert_eq!(meta.success_count, 0);
        assert_eq!(meta.number_of_finished_runs, 1);
        assert_eq!(job.stats(), vec![stat]);
    }
}

#[tokio::test]
async fn retry_stops_once_epsilon_has_elapsed() {
    let (cache, _) = system_cache(CacheKind::LockFree);
    let mut rx = cache.subscribe();

    let job = cache
        .add_job(NewJob {
            retries: 5,
            epsilon: "PT1S".to_string(),
            ..local("slow", "sleep 0.6; false")
        })
        .unwrap();
    let stat = next_run_of(&mut rx, job.id()).await;

    assert!(!stat.success);
    assert!(stat.number_of_retries < 5, "{stat:?}");
    assert_eq!(job.metadata().error_count, u64::from(stat.number_of_retries) + 1);
}

#[tokio::test]
async fn success_after_a_retry_counts_once() {
    for kind in KINDS {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let (cache, _, _) = manual_cache(kind, PersistencePolicy::Transactional);
        let mut rx = cache.subscribe();

        // Fails the first time, succeeds once the marker exists.
        let command = format!(
            "if [ -f {0} ]; then exit 0; else touch {0}; exit 1; fi",
            marker.display()
        );
        let job = cache
            .add_job(NewJob {
                retries: 3,
                ..local("second-time-lucky", &command)
            })
            .unwrap();
        let stat = next_run_of(&mut rx, job.id()).await;

        assert!(stat.success);
        assert_eq!(stat.number_of_retries, 1);
        let meta = job.metadata();
        assert_eq!((meta.success_count, meta.error_count), (1, 1));
        assert!(meta.last_success.is_some());
    }
}

#[tokio::test]
async fn on_failure_job_runs_after_terminal_failure() {
    for kind in KINDS {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("alerts");
        let (cache, _, _) = manual_cache(kind, PersistencePolicy::Transactional);
        let mut rx = cache.subscribe();

        let alert = cache
            .add_job(scheduled("alert", &append(&out, "alerted"), &far_schedule()))
            .unwrap();
        let job = cache
            .add_job(NewJob {
                on_failure_job: Some(alert.id().to_string()),
                ..local("broken", "exit 2")
            })
            .unwrap();

        assert!(next_run_of(&mut rx, alert.id()).await.success);
        assert!(!next_run_of(&mut rx, job.id()).await.success);
        assert_eq!(lines(&out), vec!["alerted"]);
        // The handler keeps its own schedule.
        assert!(alert.is_armed());
    }
}

#[tokio::test]
async fn commands_are_templated_before_running() {
    for kind in KINDS {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("owner");
        let (cache, _, _) = manual_cache(kind, PersistencePolicy::Transactional);
        let mut rx = cache.subscribe();

        let job = cache
            .add_job(NewJob {
                template_delimiters: "{{ }}".to_string(),
                ..local(
                    "templated",
                    &format!("echo {{{{ .Owner }}}}:{{{{.Name}}}} >> {}", out.display()),
                )
            })
            .unwrap();
        assert!(next_run_of(&mut rx, job.id()).await.success);
        assert_eq!(lines(&out), vec!["ops@example.com:templated"]);
    }
}

#[tokio::test]
async fn bad_template_fails_the_run() {
    let (cache, _, _) = manual_cache(CacheKind::Locked, PersistencePolicy::Transactional);
    let job = cache
        .add_job(NewJob {
            template_delimiters: "{{ }}".to_string(),
            ..scheduled("bad", "echo {{ .Nope }}", &far_schedule())
        })
        .unwrap();

    let err = cache.run_job(job.id()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTemplate(_)));
    assert_eq!(job.metadata().error_count, 1);
}

#[tokio::test]
async fn dependents_run_after_their_parent_in_order() {
    for kind in KINDS {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("order");
        let (cache, _) = system_cache(kind);

        let parent = cache
            .add_job(scheduled("a", &append(&out, "a"), &far_schedule()))
            .unwrap();
        let first = cache
            .add_job(child("b", &append(&out, "b"), &[parent.id()]))
            .unwrap();
        let second = cache
            .add_job(child("c", &append(&out, "c"), &[parent.id()]))
            .unwrap();

        cache.run_job(parent.id()).await.unwrap();
        assert_eq!(lines(&out), vec!["a", "b", "c"]);

        let parent_ran = parent.metadata().last_attempted_run.unwrap();
        let first_ran = first.metadata().last_attempted_run.unwrap();
        let second_ran = second.metadata().last_attempted_run.unwrap();
        assert!(parent_ran <= first_ran && first_ran <= second_ran);
        // Children never arm a timer of their own.
        assert!(!first.is_armed() && !second.is_armed());
    }
}

#[tokio::test]
async fn long_chains_run_top_down() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("chain");
    let (cache, _) = system_cache(CacheKind::LockFree);

    let root = cache
        .add_job(scheduled("j0", &append(&out, "0"), &far_schedule()))
        .unwrap();
    let mut previous = root.id().to_string();
    for i in 1..5 {
        let next = cache
            .add_job(child(&format!("j{i}"), &append(&out, &i.to_string()), &[previous.as_str()]))
            .unwrap();
        previous = next.id().to_string();
    }

    cache.run_job(root.id()).await.unwrap();
    assert_eq!(lines(&out), vec!["0", "1", "2", "3", "4"]);
}

#[tokio::test]
async fn failed_parent_does_not_run_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("never");
    let (cache, _, _) = manual_cache(CacheKind::Locked, PersistencePolicy::Transactional);

    let parent = cache
        .add_job(scheduled("p", "false", &far_schedule()))
        .unwrap();
    let kid = cache
        .add_job(child("c", &append(&out, "ran"), &[parent.id()]))
        .unwrap();

    assert!(cache.run_job(parent.id()).await.is_err());
    assert!(lines(&out).is_empty());
    assert_eq!(kid.metadata().number_of_finished_runs, 0);
}

#[tokio::test]
async fn fixed_repetitions_stop_after_the_last_run() {
    for kind in KINDS {
        let (cache, clock, _) = manual_cache(kind, PersistencePolicy::Transactional);
        let mut rx = cache.subscribe();
        let start = epoch() + Duration::minutes(1);

        let job = cache
            .add_job(scheduled("thrice", "true", &format!("R2/{}/PT1M", rfc3339(start))))
            .unwrap();

        for run in 1..=3u64 {
            sleepers(&clock, 1).await;
            clock.advance(Duration::minutes(1));
            let stat = next_run_of(&mut rx, job.id()).await;
            assert!(stat.success);
            assert_eq!(stat.ran_at, epoch() + Duration::minutes(run as i64));
            assert_eq!(job.metadata().number_of_finished_runs, run);
        }

        assert!(job.is_done());
        assert!(!job.is_armed());
        assert_eq!(clock.sleepers(), 0);
    }
}

#[tokio::test]
async fn recurring_job_rearms_from_its_last_run() {
    let (cache, clock, db) = manual_cache(CacheKind::LockFree, PersistencePolicy::Transactional);
    let mut rx = cache.subscribe();
    let start = epoch() + Duration::seconds(30);

    let job = cache
        .add_job(scheduled("tick", "true", &format!("R/{}/PT10S", rfc3339(start))))
        .unwrap();
    sleepers(&clock, 1).await;
    clock.advance(Duration::seconds(30));
    next_run_of(&mut rx, job.id()).await;

    assert_eq!(job.next_run_at(), Some(start + Duration::seconds(10)));
    assert!(!job.is_done());

    let stored = db.get(job.id()).unwrap();
    assert_eq!(stored.next_run_at, Some(start + Duration::seconds(10)));
    assert_eq!(stored.metadata.number_of_finished_runs, 1);
}

type Seen = Arc<Mutex<Vec<(String, String)>>>;

async fn hook(State(seen): State<Seen>, headers: HeaderMap, body: String) -> StatusCode {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    seen.lock().unwrap().push((content_type, body));
    StatusCode::CREATED
}

async fn serve_hook() -> (String, Seen) {
    let seen: Seen = Arc::default();
    let app = Router::new()
        .route("/hook", post(hook))
        .with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), seen)
}

fn remote(name: &str, props: RemoteProperties) -> NewJob {
    NewJob {
        name: name.to_string(),
        owner: "ops@example.com".to_string(),
        job_type: JobType::Remote,
        remote_properties: Some(props),
        schedule: far_schedule(),
        ..Default::default()
    }
}

#[tokio::test]
async fn remote_job_posts_a_templated_body() {
    let (url, seen) = serve_hook().await;
    let (cache, _, _) = manual_cache(CacheKind::Locked, PersistencePolicy::Transactional);

    let job = cache
        .add_job(NewJob {
            template_delimiters: "<< >>".to_string(),
            ..remote(
                "notify",
                RemoteProperties {
                    url,
                    method: "post".to_string(),
                    body: r#"{"owner":"<< .Owner >>"}"#.to_string(),
                    expected_response_codes: vec![201],
                    ..Default::default()
                },
            )
        })
        .unwrap();

    let stat = cache.run_job(job.id()).await.unwrap();
    assert!(stat.success);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![(
            "application/json".to_string(),
            r#"{"owner":"ops@example.com"}"#.to_string()
        )]
    );
}

#[tokio::test]
async fn remote_job_keeps_an_explicit_content_type() {
    let (url, seen) = serve_hook().await;
    let (cache, _, _) = manual_cache(CacheKind::LockFree, PersistencePolicy::Transactional);

    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_string(), vec!["text/plain".to_string()]);
    let job = cache
        .add_job(remote(
            "plain",
            RemoteProperties {
                url,
                method: "POST".to_string(),
                body: "hello".to_string(),
                headers,
                expected_response_codes: vec![200, 201],
                ..Default::default()
            },
        ))
        .unwrap();

    cache.run_job(job.id()).await.unwrap();
    assert_eq!(seen.lock().unwrap()[0].0, "text/plain");
}

#[tokio::test]
async fn unexpected_status_is_a_failure() {
    let (url, _) = serve_hook().await;
    let (cache, _, _) = manual_cache(CacheKind::Locked, PersistencePolicy::Transactional);

    let job = cache
        .add_job(remote(
            "strict",
            RemoteProperties {
                url,
                method: "POST".to_string(),
                ..Default::default()
            },
        ))
        .unwrap();

    match cache.run_job(job.id()).await {
        Err(SchedulerError::UnexpectedStatus { status, .. }) => assert_eq!(status, 201),
        other => panic!("expected an unexpected-status error, got {other:?}"),
    }
    assert_eq!(job.metadata().error_count, 1);
}
