//! Integration tests for debug allocators, callbacks and verification

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use nebula_alloc::allocator::{Allocator, DebugAllocator, TrackerProxyAllocator, global_heap};
use nebula_alloc::debug::{DebugRegistry, FreeEvent};
use nebula_alloc::{DebugConfig, FatalPolicy, MemoryError, here};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

fn panicking_registry() -> Arc<DebugRegistry> {
    DebugRegistry::with_policy(FatalPolicy::Panic)
}

#[test]
fn test_callbacks_see_contents_before_release() {
    let registry = panicking_registry();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    registry.register_callbacks(move |event: &FreeEvent<'_>| {
        sink.lock().push((event.allocator().to_owned(), event.contents().to_vec()));
    });

    let debug = DebugAllocator::with_registry(global_heap(), Arc::clone(&registry));
    let ptr = debug.allocate(4, here!()).expect("allocation failed");
    unsafe {
        core::ptr::copy_nonoverlapping(b"live".as_ptr(), ptr.as_ptr(), 4);
        debug.free(ptr, here!());
    }

    assert_eq!(*seen.lock(), vec![("debug".to_owned(), b"live".to_vec())]);
}

#[test]
fn test_every_callback_runs_once_per_free() {
    let registry = panicking_registry();
    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let calls = Arc::clone(&calls);
        registry.register_callbacks(move |_: &FreeEvent<'_>| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    let debug = DebugAllocator::with_registry(global_heap(), Arc::clone(&registry));
    for size in [1, 32, 100] {
        let ptr = debug.allocate(size, here!()).expect("allocation failed");
        unsafe { debug.free(ptr, here!()) };
    }
    assert_eq!(calls.load(Ordering::SeqCst), 9);
}

#[test]
fn test_clean_blocks_verify() {
    let registry = panicking_registry();
    let first = DebugAllocator::with_registry(global_heap(), Arc::clone(&registry));
    let second = DebugAllocator::with_registry(&first, Arc::clone(&registry));
    assert_eq!(registry.tracked_count(), 2);

    let a = first.allocate(24, here!()).expect("allocation failed");
    let b = second.allocate(48, here!()).expect("allocation failed");
    registry.verify_all();
    assert!(registry.check_all(here!()).is_ok());

    unsafe {
        second.free(b, here!());
        first.free(a, here!());
    }
    assert_eq!(first.live_blocks(), 0);
}

#[test]
fn test_tail_overrun_is_reported() {
    let registry = panicking_registry();
    let debug = DebugAllocator::with_registry(global_heap(), Arc::clone(&registry));
    let ptr = debug.allocate(16, here!()).expect("allocation failed");
    unsafe { ptr.as_ptr().add(16).write(0) };

    let err = registry.check_all(here!()).unwrap_err();
    assert_eq!(err.code(), "MEM:DEBUG:CORRUPTION");
    match err {
        MemoryError::Corruption { allocator, allocated_at, .. } => {
            assert_eq!(allocator, "debug");
            assert!(allocated_at.file().ends_with("debug_verification.rs"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
#[should_panic(expected = "MEM:DEBUG:CORRUPTION")]
fn test_verify_all_is_fatal_on_underrun() {
    let registry = panicking_registry();
    let debug = DebugAllocator::with_registry(global_heap(), Arc::clone(&registry));
    let ptr = debug.allocate(8, here!()).expect("allocation failed");
    unsafe { ptr.as_ptr().sub(1).write(0) };
    registry.verify_all();
}

#[test]
#[should_panic(expected = "double free")]
fn test_double_free_is_caught() {
    let debug = DebugAllocator::with_registry(global_heap(), panicking_registry());
    let ptr = debug.allocate(8, here!()).expect("allocation failed");
    unsafe {
        debug.free(ptr, here!());
        debug.free(ptr, here!());
    }
}

#[test]
fn test_debug_over_tracker_accounts_guards() {
    let tracker = TrackerProxyAllocator::new(global_heap());
    let config = DebugConfig::default();
    let debug = DebugAllocator::with_config(&tracker, panicking_registry(), config, "guarded")
        .expect("valid config");

    let ptr = debug.allocate(10, here!()).expect("allocation failed");
    assert_eq!(tracker.stats().allocated_bytes, 10 + 2 * config.guard_size);
    assert_eq!(debug.live_bytes(), 10);

    let ptr = unsafe { debug.reallocate(Some(ptr), 40, here!()) }.expect("reallocation failed");
    assert_eq!(tracker.stats().allocated_bytes, 40 + 2 * config.guard_size);
    assert!(debug.check().is_ok());

    unsafe { debug.free(ptr, here!()) };
    assert_eq!(tracker.stats().allocated_count, 0);
}

#[test]
fn test_dropped_allocators_leave_registry() {
    let registry = panicking_registry();
    {
        let _debug = DebugAllocator::with_registry(global_heap(), Arc::clone(&registry));
        assert_eq!(registry.tracked_count(), 1);
    }
    assert_eq!(registry.tracked_count(), 0);
}
