//! Safepoint convergence: request modes, convergence modes, slow mutators
//! and threads that come and go while cycles run.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use pup_gc::heap::REGION_SIZE;
use pup_gc::{Convergence, CopyPolicy, GcError, Heap, RequestMode};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use common::{
    garbage, list, list_values, manual_config, manual_config_without_copying, node, set_field,
    with_mutator, Nodes,
};

fn survives_one_cycle(heap: &Heap) {
    with_mutator(heap, |m, gc| {
        let head = m.root(list(m, 500));
        garbage(m, 2 * REGION_SIZE);

        let stats = gc.collect(m);
        assert_eq!(stats.threads_converged, 1);
        assert_eq!(stats.objects_marked, 500);
        assert_eq!(list_values(head.get()).len(), 500);
    });
}

#[test]
fn test_polling_requests() {
    let (model, _) = Nodes::new();
    let config = manual_config().with_request_mode(RequestMode::Polling);
    let heap = Heap::new(config, model).unwrap();
    survives_one_cycle(&heap);
}

#[cfg(unix)]
#[test]
fn test_signal_requests() {
    let (model, _) = Nodes::new();
    let config = manual_config().with_request_mode(RequestMode::Signal);
    let heap = Heap::new(config, model).unwrap();
    survives_one_cycle(&heap);
}

#[test]
fn test_concurrent_convergence() {
    let (model, _) = Nodes::new();
    let config = manual_config_without_copying().with_convergence(Convergence::Concurrent);
    let heap = Heap::new(config, model).unwrap();
    survives_one_cycle(&heap);
}

#[test]
fn test_concurrent_convergence_never_copies() {
    let (model, counters) = Nodes::new();
    let config = manual_config_without_copying().with_convergence(Convergence::Concurrent);
    let heap = Heap::new(config, model).unwrap();

    with_mutator(&heap, |m, gc| {
        // One live object in an otherwise dead region.
        let root = m.root(Some(node(m, 0, 3)));
        garbage(m, 2 * REGION_SIZE);
        let stats = gc.collect(m);
        assert_eq!(stats.regions_evacuated, 0);
        assert_eq!(stats.objects_copied, 0);
        assert!(root.get().is_some());
    });
    assert_eq!(counters.copied(), 0);
}

#[test]
fn test_copying_requires_hold() {
    let (model, _) = Nodes::new();
    let config = manual_config()
        .with_convergence(Convergence::Concurrent)
        .with_copy_policy(CopyPolicy::default());
    assert!(matches!(
        Heap::new(config, model),
        Err(GcError::InvalidConfig(_))
    ));
}

#[test]
fn test_attaching_twice_fails() {
    let (model_a, _) = Nodes::new();
    let (model_b, _) = Nodes::new();
    let a = Heap::new(manual_config(), model_a).unwrap();
    let b = Heap::new(manual_config(), model_b).unwrap();

    let mutator = a.attach_current_thread().unwrap();
    assert!(matches!(
        a.attach_current_thread(),
        Err(GcError::AlreadyAttached)
    ));
    assert!(matches!(
        b.attach_current_thread(),
        Err(GcError::AlreadyAttached)
    ));

    drop(mutator);
    let again = b.attach_current_thread().unwrap();
    assert!(again.thread_id() >= 1);
}

#[test]
fn test_detached_thread_hands_its_region_over() {
    let (model, counters) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();

    thread::scope(|scope| {
        scope.spawn(|| {
            let mutator = heap.attach_current_thread().unwrap();
            for _ in 0..100 {
                node(&mutator, 0, 1);
            }
        });
    });
    assert_eq!(heap.global_regions(), 1);

    let stats = heap.collect().unwrap();
    assert_eq!(stats.threads_converged, 0);
    assert_eq!(stats.regions_reclaimed, 1);
    assert_eq!(counters.destroyed(), 100);
}

#[test]
fn test_threads_attach_and_detach_while_cycles_run() {
    let (model, _) = Nodes::new();
    let config = manual_config().with_request_mode(RequestMode::Polling);
    let heap = Heap::new(config, model).unwrap();
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| loop {
                let m = heap.attach_current_thread().unwrap();
                let head = m.root(list(&m, 50));
                garbage(&m, 64 * 1024);
                m.safepoint();
                assert_eq!(list_values(head.get()).len(), 50);
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            });
        }
        for _ in 0..20 {
            heap.collect().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
    });

    assert_eq!(heap.metrics().total_cycles(), 20);
    assert!(heap.metrics().total_attaches() >= 4);
}

#[test]
fn test_mutators_with_background_collector() {
    const NODES: u64 = 20_000;

    let (model, _) = Nodes::new();
    let config = manual_config()
        .with_background_collector(true)
        .with_collect_interval(Duration::from_millis(5));
    let heap = Heap::new(config, model).unwrap();

    thread::scope(|scope| {
        for t in 0..2u64 {
            let heap = &heap;
            scope.spawn(move || {
                let m = heap.attach_current_thread().unwrap();
                let head = m.root(None);
                for i in 0..NODES {
                    let n = node(&m, 2, t * NODES + i);
                    set_field(n, 0, head.get());
                    head.set(Some(n));
                    garbage(&m, 256);
                    m.safepoint();
                }
                let deadline = Instant::now() + Duration::from_secs(30);
                while heap.metrics().total_cycles() < 3 && Instant::now() < deadline {
                    garbage(&m, 1024);
                    m.safepoint();
                }
                let expected: Vec<u64> = (0..NODES).rev().map(|i| t * NODES + i).collect();
                assert_eq!(list_values(head.get()), expected);
            });
        }
    });

    assert!(heap.metrics().total_cycles() >= 3);
}

// ============================================================================
// Slow safepoints
// ============================================================================

/// Counts WARN events.
struct CountWarnings(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> Layer<S> for CountWarnings {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn test_slow_safepoint_warns_and_keeps_waiting() {
    let warnings = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(CountWarnings(Arc::clone(&warnings)));
    let _default = tracing::subscriber::set_default(subscriber);

    let (model, _) = Nodes::new();
    let config = manual_config().with_safepoint_warn_after(Duration::from_millis(20));
    let heap = Heap::new(config, model).unwrap();
    let ready = Barrier::new(2);
    let done = AtomicBool::new(false);

    let stats = thread::scope(|scope| {
        scope.spawn(|| {
            let m = heap.attach_current_thread().unwrap();
            ready.wait();
            // Busy without polling.
            let start = Instant::now();
            while start.elapsed() < Duration::from_millis(200) {
                std::hint::spin_loop();
            }
            while !done.load(Ordering::Acquire) {
                m.safepoint();
                thread::yield_now();
            }
        });
        ready.wait();
        let stats = heap.collect().unwrap();
        done.store(true, Ordering::Release);
        stats
    });

    assert_eq!(stats.threads_converged, 1);
    assert!(stats.safepoint_timeouts >= 1);
    assert!(stats.phases.converge >= Duration::from_millis(20));
    assert!(warnings.load(Ordering::SeqCst) >= stats.safepoint_timeouts as usize);
    assert_eq!(
        heap.metrics().total_safepoint_timeouts(),
        u64::from(stats.safepoint_timeouts)
    );
}
