/*
 * debug.rs
 *
 * Opt-in process-wide misuse detection.
 *
 * The typed handle API already makes the classic C mistakes
 * unrepresentable (add before assign, use of a freed event). What remains
 * detectable at runtime is lifecycle misuse across the reactor boundary:
 * operating on an event whose slot was torn down, or tearing one down
 * twice. With debug mode on these panic with a diagnostic; with it off
 * the normal error paths apply and this module costs one atomic load.
 *
 * Call enable_debug_mode() before creating any reactor.
 */

use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::HashMap;
use std::sync::Mutex;

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);

/* lifecycle per live event, keyed by the reactor-assigned unique id */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifeState {
    Assigned,
    Added,
}

static REGISTRY: Mutex<Option<HashMap<u64, LifeState>>> = Mutex::new(None);

fn with_registry<R>(f: impl FnOnce(&mut HashMap<u64, LifeState>) -> R) -> R {
    let mut guard = REGISTRY
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    f(guard.get_or_insert_with(HashMap::new))
}

/// Turn on misuse tracking for every reactor in the process.
pub fn enable_debug_mode() {
    DEBUG_MODE.store(true, Ordering::SeqCst);
}

#[inline]
pub(crate) fn enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

pub(crate) fn note_assign(id: u64) {
    if !enabled() {
        return;
    }
    with_registry(|reg| {
        let prev = reg.insert(id, LifeState::Assigned);
        assert!(prev.is_none(), "event {id} assigned twice");
    });
}

pub(crate) fn note_add(id: u64) {
    if !enabled() {
        return;
    }
    with_registry(|reg| match reg.get_mut(&id) {
        Some(state) => *state = LifeState::Added,
        None => panic!("add on event {id} that was never assigned or already torn down"),
    });
}

pub(crate) fn note_del(id: u64) {
    if !enabled() {
        return;
    }
    with_registry(|reg| match reg.get_mut(&id) {
        Some(state) => *state = LifeState::Assigned,
        None => panic!("del on event {id} that was never assigned or already torn down"),
    });
}

pub(crate) fn note_teardown(id: u64) {
    if !enabled() {
        return;
    }
    with_registry(|reg| {
        assert!(
            reg.remove(&id).is_some(),
            "event {id} torn down twice"
        );
    });
}
