// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use jobcoord::{CoordinatorConfig, Job, JobCoordinator, PendingCompletion};
use jobcoord_tests::{
    init_logging, wait_for, Completions, ExclusionTracker, ManualCompletions, Recorder,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn coordinator(workers: usize) -> JobCoordinator {
    init_logging();
    JobCoordinator::new(CoordinatorConfig::default().with_workers(workers))
        .unwrap_or_else(|e| panic!("failed to start coordinator: {e}"))
}

#[test]
fn test_always_failing_job_is_abandoned_after_retries() {
    let coordinator = coordinator(2);
    let calls = Arc::new(AtomicU32::new(0));

    let c = calls.clone();
    let admitted = coordinator.enqueue_job_with_retries(
        "A",
        move || -> Completions {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(vec![PendingCompletion::failed(anyhow::anyhow!("write conflict"))])
        },
        2,
    );
    assert!(admitted.is_ok());

    assert!(coordinator.wait_until_idle(Some(TIMEOUT)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let snapshot = coordinator.monitor();
    assert_eq!(snapshot.abandoned, 1);
    assert_eq!(snapshot.succeeded, 0);
    coordinator.wait_until_finished();
}

#[test]
fn test_job_succeeding_on_last_retry() {
    let coordinator = coordinator(2);
    let calls = Arc::new(AtomicU32::new(0));

    let c = calls.clone();
    coordinator
        .enqueue_job_with_retries(
            "A",
            move || -> Completions {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(vec![PendingCompletion::failed(anyhow::anyhow!("transient"))])
                } else {
                    Ok(vec![PendingCompletion::succeeded()])
                }
            },
            2,
        )
        .unwrap();

    assert!(coordinator.wait_until_idle(Some(TIMEOUT)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let snapshot = coordinator.monitor();
    assert_eq!(snapshot.succeeded, 1);
    assert_eq!(snapshot.abandoned, 0);
    assert_eq!(snapshot.retried, 2);
    coordinator.wait_until_finished();
}

#[test]
fn test_second_job_waits_for_unresolved_first_job() {
    let coordinator = coordinator(4);
    let recorder = Recorder::new();
    let manual = ManualCompletions::new();

    let r = recorder.clone();
    let m = manual.clone();
    coordinator
        .enqueue_job("X", move || -> Completions {
            r.record("job1-start");
            Ok(vec![m.next()])
        })
        .unwrap();
    let r = recorder.clone();
    coordinator
        .enqueue_job("X", move || -> Completions {
            r.record("job2-start");
            Ok(vec![])
        })
        .unwrap();

    assert!(wait_for(TIMEOUT, || manual.issued() == 1));
    // free workers are available, but the key is taken
    thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.events(), vec!["job1-start"]);
    assert_eq!(coordinator.incomplete_task_count(), 2);

    manual.succeed_all();
    assert!(coordinator.wait_until_idle(Some(TIMEOUT)));
    assert_eq!(recorder.events(), vec!["job1-start", "job2-start"]);
    coordinator.wait_until_finished();
}

#[test]
fn test_compensator_runs_once_with_failed_completions() {
    let coordinator = coordinator(2);
    let calls = Arc::new(AtomicU32::new(0));
    let compensations = Arc::new(Mutex::new(Vec::new()));

    let c = calls.clone();
    let comp = compensations.clone();
    coordinator
        .enqueue_job_with_compensator(
            "Y",
            move || -> Completions {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(vec![
                    PendingCompletion::succeeded(),
                    PendingCompletion::failed(anyhow::anyhow!("port binding rejected")),
                ])
            },
            move |failed: Vec<PendingCompletion>| -> Completions {
                comp.lock().unwrap().push(failed);
                Ok(vec![PendingCompletion::succeeded()])
            },
            0,
        )
        .unwrap();

    assert!(coordinator.wait_until_idle(Some(TIMEOUT)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let compensations = compensations.lock().unwrap();
    assert_eq!(compensations.len(), 1);
    assert_eq!(compensations[0].len(), 1);
    assert!(matches!(compensations[0][0].peek(), Some(Err(_))));

    let snapshot = coordinator.monitor();
    assert_eq!(snapshot.abandoned, 1);
    assert_eq!(snapshot.compensated, 1);
    coordinator.wait_until_finished();
}

#[test]
fn test_compensator_only_after_all_attempts_failed() {
    let coordinator = coordinator(1);
    let recorder = Recorder::new();

    let r = recorder.clone();
    let rc = recorder.clone();
    let job = Job::new("Y", move || -> Completions {
        r.record("attempt");
        anyhow::bail!("datastore unavailable")
    })
    .with_max_retries(3)
    .with_compensator(move |_failed: Vec<PendingCompletion>| -> Completions {
        rc.record("compensate");
        Ok(vec![])
    });
    coordinator.enqueue(job).unwrap();

    assert!(coordinator.wait_until_idle(Some(TIMEOUT)));
    assert_eq!(
        recorder.events(),
        vec!["attempt", "attempt", "attempt", "attempt", "compensate"]
    );
    coordinator.wait_until_finished();
}

#[test]
fn test_next_job_waits_for_unresolved_compensation() {
    let coordinator = coordinator(4);
    let recorder = Recorder::new();
    let manual = ManualCompletions::new();
    let exclusion = ExclusionTracker::new();

    let r = recorder.clone();
    let p = exclusion.clone();
    let rc = recorder.clone();
    let pc = exclusion.clone();
    let m = manual.clone();
    let job = Job::new("C", move || -> Completions {
        p.around("C", || r.record("job1-attempt"));
        anyhow::bail!("row locked")
    })
    .with_compensator(move |_failed: Vec<PendingCompletion>| -> Completions {
        // held until the compensating write resolves
        pc.enter("C");
        rc.record("compensate");
        let pending = m.next();
        Ok(vec![PendingCompletion::new(async move {
            let res = pending.wait().await;
            pc.exit("C");
            res.map_err(anyhow::Error::from)
        })])
    });
    coordinator.enqueue(job).unwrap();

    let r = recorder.clone();
    let p = exclusion.clone();
    coordinator
        .enqueue_job("C", move || -> Completions {
            p.around("C", || r.record("job2-start"));
            Ok(vec![])
        })
        .unwrap();

    assert!(wait_for(TIMEOUT, || manual.issued() == 1));
    // free workers are available, but the key is still compensating
    thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.events(), vec!["job1-attempt", "compensate"]);
    assert_eq!(coordinator.incomplete_task_count(), 2);

    manual.succeed_all();
    assert!(coordinator.wait_until_idle(Some(TIMEOUT)));
    assert_eq!(recorder.events(), vec!["job1-attempt", "compensate", "job2-start"]);
    assert_eq!(exclusion.overlaps(), 0);

    let snapshot = coordinator.monitor();
    assert_eq!(snapshot.compensated, 1);
    assert_eq!(snapshot.abandoned, 1);
    assert_eq!(snapshot.succeeded, 1);
    coordinator.wait_until_finished();
}

#[test]
fn test_many_jobs_across_keys_keep_per_key_order() {
    let coordinator = coordinator(4);
    let recorder = Recorder::new();
    let tracker = ExclusionTracker::new();

    for i in 0..100 {
        let key = format!("key-{}", i % 10);
        let r = recorder.clone();
        let p = tracker.clone();
        let action_key = key.clone();
        coordinator
            .enqueue_job(key, move || -> Completions {
                p.around(&action_key, || {
                    thread::sleep(Duration::from_millis(1));
                    r.record(format!("{action_key}/{i}"));
                });
                Ok(vec![PendingCompletion::succeeded()])
            })
            .unwrap();
    }

    assert!(coordinator.wait_until_idle(Some(TIMEOUT)));
    assert_eq!(recorder.events().len(), 100);
    assert_eq!(tracker.overlaps(), 0);
    assert!(tracker.max_parallel() <= 4);

    for k in 0..10 {
        let expected: Vec<String> = (0..100)
            .filter(|i| i % 10 == k)
            .map(|i| format!("key-{k}/{i}"))
            .collect();
        assert_eq!(recorder.with_prefix(&format!("key-{k}/")), expected);
    }

    let snapshot = coordinator.monitor();
    assert_eq!(snapshot.admitted, 100);
    assert_eq!(snapshot.succeeded, 100);
    assert_eq!(snapshot.incomplete, 0);
    coordinator.wait_until_finished();
}

#[test]
fn test_distinct_keys_run_in_parallel() {
    let coordinator = coordinator(4);
    let tracker = ExclusionTracker::new();

    for k in 0..4 {
        let p = tracker.clone();
        let key = format!("dpn-{k}");
        let action_key = key.clone();
        coordinator
            .enqueue_job(key, move || -> Completions {
                p.around(&action_key, || thread::sleep(Duration::from_millis(200)));
                Ok(vec![])
            })
            .unwrap();
    }

    assert!(coordinator.wait_until_idle(Some(TIMEOUT)));
    assert!(tracker.max_parallel() >= 2);
    assert_eq!(tracker.overlaps(), 0);
    coordinator.wait_until_finished();
}

#[test]
fn test_retries_stay_exclusive_per_key() {
    let coordinator = coordinator(4);
    let tracker = ExclusionTracker::new();
    let attempts = Arc::new(AtomicU32::new(0));

    for i in 0..20 {
        let p = tracker.clone();
        let a = attempts.clone();
        let mut tries = 0;
        coordinator
            .enqueue_job_with_retries(
                "tunnel-group-1",
                move || -> Completions {
                    tries += 1;
                    a.fetch_add(1, Ordering::SeqCst);
                    p.around("tunnel-group-1", || thread::sleep(Duration::from_millis(1)));
                    if tries == 1 && i % 2 == 0 {
                        anyhow::bail!("first attempt of even job fails");
                    }
                    Ok(vec![])
                },
                1,
            )
            .unwrap();
    }

    assert!(coordinator.wait_until_idle(Some(TIMEOUT)));
    assert_eq!(tracker.overlaps(), 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 30);
    assert_eq!(coordinator.monitor().succeeded, 20);
    coordinator.wait_until_finished();
}

#[test]
fn test_stuck_completion_times_out_and_frees_the_key() {
    init_logging();
    let config = CoordinatorConfig::default()
        .with_workers(2)
        .with_completion_timeout(Duration::from_millis(50));
    let coordinator = JobCoordinator::new(config).unwrap();
    let manual = ManualCompletions::new();
    let recorder = Recorder::new();

    let m = manual.clone();
    coordinator
        .enqueue_job("Z", move || -> Completions { Ok(vec![m.next()]) })
        .unwrap();
    let r = recorder.clone();
    coordinator
        .enqueue_job("Z", move || -> Completions {
            r.record("next");
            Ok(vec![])
        })
        .unwrap();

    assert!(coordinator.wait_until_idle(Some(TIMEOUT)));
    assert_eq!(recorder.events(), vec!["next"]);
    let snapshot = coordinator.monitor();
    assert_eq!(snapshot.abandoned, 1);
    assert_eq!(snapshot.succeeded, 1);
    coordinator.wait_until_finished();
}

#[test]
fn test_drain_policy_runs_queued_jobs_after_shutdown() {
    let coordinator = coordinator(1);
    let manual = ManualCompletions::new();
    let recorder = Recorder::new();

    let m = manual.clone();
    coordinator
        .enqueue_job("A", move || -> Completions { Ok(vec![m.next()]) })
        .unwrap();
    for i in 0..3 {
        let r = recorder.clone();
        coordinator
            .enqueue_job("A", move || -> Completions {
                r.record(format!("queued-{i}"));
                Ok(vec![])
            })
            .unwrap();
    }
    assert!(wait_for(TIMEOUT, || manual.issued() == 1));

    coordinator.shutdown();
    assert!(coordinator
        .enqueue_job("A", || -> Completions { Ok(vec![]) })
        .is_err());

    manual.succeed_all();
    coordinator.wait_until_finished();
    assert_eq!(recorder.events(), vec!["queued-0", "queued-1", "queued-2"]);
    assert_eq!(coordinator.monitor().succeeded, 4);
}

#[test]
fn test_gauge_tracks_admissions_and_resolutions() {
    let coordinator = coordinator(2);
    let manual = ManualCompletions::new();

    for k in 0..3 {
        let m = manual.clone();
        coordinator
            .enqueue_job(format!("port-{k}"), move || -> Completions { Ok(vec![m.next()]) })
            .unwrap();
    }
    assert_eq!(coordinator.incomplete_task_count(), 3);

    // two workers, so only two jobs can be waiting on completions
    assert!(wait_for(TIMEOUT, || manual.issued() == 2));
    manual.fail_all("rejected");
    assert!(wait_for(TIMEOUT, || manual.issued() == 1));
    assert!(wait_for(TIMEOUT, || coordinator.incomplete_task_count() == 1));

    manual.succeed_all();
    assert!(coordinator.wait_until_idle(Some(TIMEOUT)));
    let snapshot = coordinator.monitor();
    assert_eq!(snapshot.abandoned, 2);
    assert_eq!(snapshot.succeeded, 1);
    coordinator.wait_until_finished();
}
