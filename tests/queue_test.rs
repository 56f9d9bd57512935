//! Integration tests for task queues running against a live affinity thread.

use affinity_sched::{
    AffinityContext, AffinityThread, AffinityThreadConfig, Cancellation, Error, SchedulerFactory,
    TaskError, TaskQueue,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn started_host() -> Arc<AffinityThread> {
    AffinityThread::spawn(AffinityThreadConfig::default()).expect("failed to start affinity thread")
}

fn queue_on(host: &Arc<AffinityThread>) -> (SchedulerFactory, Arc<TaskQueue>) {
    let factory = SchedulerFactory::new(host.clone());
    let queue = Arc::new(factory.create_queue());
    (factory, queue)
}

/// Wait for every task from `factory` to be destroyed, not just settled.
fn settle(factory: &SchedulerFactory) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    runtime
        .block_on(async {
            tokio::time::timeout(Duration::from_secs(5), factory.wait_idle()).await
        })
        .expect("tasks should settle");
}

/// Occupy the affinity thread until the returned sender fires (or drops).
fn block_affinity_thread(host: &AffinityThread) -> mpsc::Sender<()> {
    let (release, gate) = mpsc::channel::<()>();
    let (entered_tx, entered_rx) = mpsc::channel();
    host.switch_to_affinity_thread(Box::new(move || {
        entered_tx.send(()).unwrap();
        let _ = gate.recv();
    }))
    .unwrap();
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("affinity thread never picked up the blocker");
    release
}

// ---------------------------------------------------------------------------
// Ordering and inline execution
// ---------------------------------------------------------------------------

#[test]
fn affine_submissions_run_in_submission_order() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);
    let log = Arc::new(Mutex::new(Vec::new()));

    let q = Arc::clone(&queue);
    let l = Arc::clone(&log);
    host.invoke(move || {
        for name in ["A", "B", "C"] {
            let l = Arc::clone(&l);
            q.schedule_action(name, None, move || {
                l.lock().unwrap().push(name);
                Ok(())
            })
            .unwrap();
        }
    })
    .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C"]);
}

#[test]
fn affine_submission_runs_within_the_call_and_wait_does_not_deadlock() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);

    let q = Arc::clone(&queue);
    let (ran_inline, same_thread) = host
        .invoke(move || {
            let ran = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&ran);
            let caller = thread::current().id();
            let handle = q
                .schedule_fn("inline", None, move || {
                    flag.store(true, Ordering::SeqCst);
                    Ok(thread::current().id())
                })
                .unwrap();
            let ran_inline = ran.load(Ordering::SeqCst);
            let ran_on = handle.wait().unwrap();
            (ran_inline, ran_on == caller)
        })
        .unwrap();

    assert!(ran_inline, "body should have run before schedule_fn returned");
    assert!(same_thread);
}

#[test]
fn cross_thread_submission_returns_before_the_body_runs() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);
    let release = block_affinity_thread(&host);

    let started = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&started);
    let handle = queue
        .schedule_action("deferred", None, move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    assert!(!started.load(Ordering::SeqCst));
    release.send(()).unwrap();

    handle.wait().unwrap();
    assert!(started.load(Ordering::SeqCst));
}

#[test]
fn cross_thread_task_does_not_split_an_affine_batch() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);
    let log = Arc::new(Mutex::new(Vec::new()));

    let d = {
        let log = Arc::clone(&log);
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            queue
                .schedule_action("D", None, move || {
                    log.lock().unwrap().push("D");
                    Ok(())
                })
                .unwrap()
        })
    };

    let q = Arc::clone(&queue);
    let l = Arc::clone(&log);
    host.invoke(move || {
        for name in ["A", "B", "C"] {
            let l = Arc::clone(&l);
            q.schedule_action(name, None, move || {
                l.lock().unwrap().push(name);
                Ok(())
            })
            .unwrap();
        }
    })
    .unwrap();

    d.join().unwrap().wait().unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(log.len(), 4);
    let a = log.iter().position(|n| *n == "A").unwrap();
    assert_eq!(&log[a..a + 3], ["A", "B", "C"]);
}

// ---------------------------------------------------------------------------
// Max concurrency
// ---------------------------------------------------------------------------

#[test]
fn at_most_one_body_runs_under_concurrent_producers() {
    let host = started_host();
    let (factory, queue) = queue_on(&host);
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..8)
        .map(|p| {
            let queue = Arc::clone(&queue);
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            let completed = Arc::clone(&completed);
            thread::spawn(move || {
                let handles: Vec<_> = (0..25)
                    .map(|t| {
                        let active = Arc::clone(&active);
                        let max_seen = Arc::clone(&max_seen);
                        let completed = Arc::clone(&completed);
                        queue
                            .schedule_action(&format!("p{p}-t{t}"), None, move || {
                                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                                max_seen.fetch_max(now, Ordering::SeqCst);
                                thread::sleep(Duration::from_micros(50));
                                active.fetch_sub(1, Ordering::SeqCst);
                                completed.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap()
                    })
                    .collect();
                for handle in handles {
                    handle.wait().unwrap();
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    assert_eq!(completed.load(Ordering::SeqCst), 200);
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    settle(&factory);
    assert_eq!(factory.in_flight(), 0);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[test]
fn cancel_before_start_never_runs_the_body() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);
    let release = block_affinity_thread(&host);
    let cancellation = Cancellation::new();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let handle = queue
        .schedule_action("withdrawn", Some(&cancellation), move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    cancellation.cancel();
    // Settles as canceled while the affinity thread is still busy.
    let err = handle.wait().unwrap_err();
    assert!(err.is_canceled());

    release.send(()).unwrap();
    host.invoke(|| ()).unwrap();
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn cancel_after_start_lets_the_body_finish() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);
    let cancellation = Cancellation::new();
    let (started_tx, started_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    let observed = cancellation.clone();
    let handle = queue
        .schedule_fn("cooperative", Some(&cancellation), move || {
            started_tx.send(()).unwrap();
            resume_rx.recv().unwrap();
            Ok(observed.is_canceled())
        })
        .unwrap();

    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    cancellation.cancel();
    resume_tx.send(()).unwrap();

    // Ran to completion and saw the signal it may choose to honor.
    assert!(handle.wait().unwrap());
}

#[test]
fn cancel_fired_before_submission_is_honored() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);
    let cancellation = Cancellation::new();
    cancellation.cancel();

    let q = Arc::clone(&queue);
    let token = cancellation.clone();
    let (ran, err) = host
        .invoke(move || {
            let ran = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&ran);
            let handle = q
                .schedule_action("already-canceled", Some(&token), move || {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            (ran.load(Ordering::SeqCst), handle.wait().unwrap_err())
        })
        .unwrap();

    assert!(!ran);
    assert!(err.is_canceled());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[test]
fn failed_task_reports_failure_and_next_task_still_runs() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);

    let failed = queue
        .schedule_fn("fails", None, || -> anyhow::Result<u32> {
            anyhow::bail!("no such widget")
        })
        .unwrap();
    let next = queue.schedule_fn("next", None, || Ok(5u32)).unwrap();

    match failed.wait() {
        Err(TaskError::Failed { name, error }) => {
            assert_eq!(name, "fails");
            assert!(error.to_string().contains("no such widget"));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(next.wait().unwrap(), 5);
}

#[test]
fn panicking_task_does_not_take_down_the_affinity_thread() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);

    let boom = queue
        .schedule_action("boom", None, || panic!("kaboom"))
        .unwrap();
    assert!(matches!(
        boom.wait(),
        Err(TaskError::Panicked { ref message, .. }) if message == "kaboom"
    ));

    let after = queue.schedule_fn("after", None, || Ok("alive")).unwrap();
    assert_eq!(after.wait().unwrap(), "alive");
}

// ---------------------------------------------------------------------------
// Asynchronous shapes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn async_function_completes_after_nested_work() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);

    let handle = queue
        .schedule_async_fn("nested", None, || async {
            let mut total = 0;
            for i in 1..=3 {
                tokio::task::yield_now().await;
                total += i;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(total)
        })
        .unwrap();

    assert_eq!(handle.await.unwrap(), 6);
}

#[tokio::test]
async fn async_action_runs_on_the_affinity_thread_across_awaits() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);
    let probe = host.clone();

    let handle = queue
        .schedule_async_fn("stays-affine", None, move || async move {
            let before = probe.is_on_affinity_thread();
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(before && probe.is_on_affinity_thread())
        })
        .unwrap();

    assert!(handle.await.unwrap());
}

#[test]
fn async_bodies_start_in_submission_order_on_the_affinity_thread() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);
    let log = Arc::new(Mutex::new(Vec::new()));

    let q = Arc::clone(&queue);
    let l = Arc::clone(&log);
    let handles = host
        .invoke(move || {
            let first = {
                let l = Arc::clone(&l);
                q.schedule_async("async-1", None, move || async move {
                    l.lock().unwrap().push("async-1 start");
                    tokio::task::yield_now().await;
                    l.lock().unwrap().push("async-1 end");
                    Ok(())
                })
                .unwrap()
            };
            let second = {
                let l = Arc::clone(&l);
                q.schedule_action("sync-2", None, move || {
                    l.lock().unwrap().push("sync-2");
                    Ok(())
                })
                .unwrap()
            };
            (first, second)
        })
        .unwrap();

    handles.0.wait().unwrap();
    handles.1.wait().unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(log[0], "async-1 start");
    assert_eq!(log[1], "sync-2");
    assert_eq!(log[2], "async-1 end");
}

#[test]
fn affine_wait_on_suspended_async_task_reports_deadlock() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);

    let q = Arc::clone(&queue);
    let err = host
        .invoke(move || {
            q.schedule_async("suspends", None, || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            })
            .unwrap()
            .wait()
            .unwrap_err()
        })
        .unwrap();

    assert!(matches!(err, TaskError::WouldDeadlock { .. }));
}

#[test]
fn failing_async_function_surfaces_its_error() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);

    let handle = queue
        .schedule_async_fn("async-fail", None, || async {
            tokio::task::yield_now().await;
            Err::<(), _>(anyhow::anyhow!("remote refused"))
        })
        .unwrap();

    let err = handle.wait().unwrap_err();
    assert!(matches!(err, TaskError::Failed { .. }));
    assert!(err.to_string().contains("remote refused"));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn queue_used_before_affinity_thread_is_known_fails_and_stays_failed() {
    let host = Arc::new(AffinityThread::new(AffinityThreadConfig::default()));
    let factory = SchedulerFactory::new(host.clone());
    let queue = factory.create_queue();
    assert!(!queue.is_active());

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let err = queue
        .schedule_action("too-early", None, move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, Error::AffinityThreadUnknown));

    // The host coming up later does not revive this queue.
    host.start().unwrap();
    let err = queue.schedule_action("still-too-early", None, || Ok(())).unwrap_err();
    assert!(matches!(err, Error::AffinityThreadUnknown));
    assert!(!queue.is_active());
    assert!(!ran.load(Ordering::SeqCst));

    // A fresh queue from the same factory works.
    let fresh = factory.create_queue();
    assert_eq!(fresh.schedule_fn("ok", None, || Ok(1)).unwrap().wait().unwrap(), 1);
    assert!(fresh.is_active());
}

#[test]
fn concurrent_first_submissions_bind_exactly_one_scheduler() {
    let host = started_host();
    let (factory, queue) = queue_on(&host);
    let barrier = Arc::new(std::sync::Barrier::new(6));

    let threads: Vec<_> = (0..6)
        .map(|i| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                queue
                    .schedule_fn(&format!("first-{i}"), None, move || Ok(i))
                    .unwrap()
                    .wait()
                    .unwrap()
            })
        })
        .collect();

    let mut results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    results.sort();
    assert_eq!(results, (0..6).collect::<Vec<_>>());
    assert!(queue.is_active());
    settle(&factory);
    assert_eq!(factory.in_flight(), 0);
}

#[test]
fn tasks_left_behind_at_shutdown_are_abandoned() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);

    // The blocker stops the loop from inside, after the orphan is queued.
    let (release, gate) = mpsc::channel::<()>();
    let (entered_tx, entered_rx) = mpsc::channel();
    let stopper = host.clone();
    host.switch_to_affinity_thread(Box::new(move || {
        entered_tx.send(()).unwrap();
        let _ = gate.recv();
        stopper.shutdown();
    }))
    .unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let handle = queue.schedule_action("orphan", None, || Ok(())).unwrap();
    release.send(()).unwrap();

    assert!(matches!(handle.wait(), Err(TaskError::Abandoned { .. })));
    assert!(matches!(
        queue.schedule_action("late", None, || Ok(())),
        Err(Error::HostShutDown)
    ));
}

#[test]
fn suspended_async_task_at_shutdown_is_interrupted_not_abandoned() {
    let host = started_host();
    let (_factory, queue) = queue_on(&host);

    let (started_tx, started_rx) = mpsc::channel();
    let handle = queue
        .schedule_async("long", None, move || async move {
            started_tx.send(()).unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    host.shutdown();

    let err = handle.wait().unwrap_err();
    assert!(matches!(err, TaskError::Interrupted { .. }), "got {err}");
    assert_eq!(err.task_name(), "long");
}

// ---------------------------------------------------------------------------
// Tracking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_idle_resolves_once_queued_work_settles() {
    let host = started_host();
    let (factory, queue) = queue_on(&host);

    for i in 0..10 {
        queue
            .schedule_async_fn(&format!("t{i}"), None, move || async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(i)
            })
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
        .await
        .expect("queue should go idle");
    assert_eq!(queue.in_flight(), 0);

    tokio::time::timeout(Duration::from_secs(5), factory.wait_idle())
        .await
        .expect("factory should go idle");
    assert_eq!(factory.in_flight(), 0);
}
