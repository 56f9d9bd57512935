//! Integration tests for the scheduler factory.

use affinity_sched::{
    AffinityContext, AffinityScheduler, AffinityThread, AffinityThreadConfig, Error,
    SchedulerFactory,
};
use futures::future::LocalBoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts every query the scheduler core makes of the host.
#[derive(Default)]
struct CountingContext {
    queries: AtomicUsize,
}

impl AffinityContext for CountingContext {
    fn has_affinity_thread(&self) -> bool {
        self.queries.fetch_add(1, Ordering::SeqCst);
        false
    }

    fn is_on_affinity_thread(&self) -> bool {
        self.queries.fetch_add(1, Ordering::SeqCst);
        false
    }

    fn switch_to_affinity_thread(
        &self,
        _continuation: affinity_sched::context::Continuation,
    ) -> affinity_sched::Result<()> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Err(Error::AffinityThreadUnknown)
    }

    fn drive(&self, _future: LocalBoxFuture<'static, ()>) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn creating_queues_never_touches_the_context() {
    let context = Arc::new(CountingContext::default());
    let factory = SchedulerFactory::new(context.clone());

    let queues: Vec<_> = (0..3).map(|_| factory.create_queue()).collect();

    assert_eq!(context.queries.load(Ordering::SeqCst), 0);
    assert!(queues.iter().all(|q| !q.is_active()));
}

#[test]
fn each_queue_gets_its_own_label() {
    let host = Arc::new(AffinityThread::new(AffinityThreadConfig::default()));
    let factory = SchedulerFactory::new(host);

    let a = factory.create_queue();
    let b = factory.create_queue();
    assert_ne!(a.label(), b.label());
}

#[test]
fn first_submission_is_what_consults_the_context() {
    let context = Arc::new(CountingContext::default());
    let factory = SchedulerFactory::new(context.clone());
    let queue = factory.create_queue();

    let err = queue.schedule_action("probe", None, || Ok(())).unwrap_err();
    assert!(matches!(err, Error::AffinityThreadUnknown));
    assert_eq!(context.queries.load(Ordering::SeqCst), 1);

    // Poisoned: no further materialization attempts.
    let _ = queue.schedule_action("again", None, || Ok(()));
    assert_eq!(context.queries.load(Ordering::SeqCst), 1);
    assert_eq!(factory.in_flight(), 0);
}

#[test]
fn scheduler_declares_single_worker() {
    let host = AffinityThread::spawn(AffinityThreadConfig::default()).unwrap();
    let scheduler = AffinityScheduler::new(host).unwrap();

    assert_eq!(AffinityScheduler::MAX_CONCURRENCY, 1);
    assert_eq!(scheduler.max_concurrency(), 1);
    assert_eq!(scheduler.scheduled_tasks().count(), 0);
}
