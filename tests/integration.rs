/*
 * integration.rs
 *
 * End-to-end scenarios against the public API: real pipes, real signals,
 * real threads, real time. Timing assertions use generous upper bounds to
 * survive CI scheduler jitter; lower bounds are the contract.
 */

use core::time::Duration;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use evreactor::{
    DispatchFlags, DispatchOutcome, Event, EventMask, Reactor, ReactorConfig, Target, Timeout,
};

/* ========================================================================= *
 * helpers
 * ========================================================================= */

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid 2-element array, pipe() writes exactly 2 fds.
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe failed");
    for fd in fds {
        // SAFETY: fd just came from pipe(); fcntl on a valid fd.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    (fds[0], fds[1])
}

fn close_fd(fd: RawFd) {
    // SAFETY: fd is a live fd owned by the test.
    unsafe {
        libc::close(fd);
    }
}

fn write_byte(fd: RawFd) {
    // SAFETY: fd is the live write end of a test pipe.
    let n = unsafe { libc::write(fd, b"a".as_ptr().cast(), 1) };
    assert_eq!(n, 1, "pipe write failed");
}

fn read_byte(fd: RawFd) {
    let mut buf = [0u8; 1];
    // SAFETY: buf is a valid 1-byte buffer; fd is non-blocking.
    unsafe {
        libc::read(fd, buf.as_mut_ptr().cast(), 1);
    }
}

/* ========================================================================= *
 * timers
 * ========================================================================= */

#[test]
fn basic_timer_fires_once_after_delay() {
    let reactor = Reactor::new().unwrap();
    let fired = Arc::new(Mutex::new(Vec::new()));

    let fired2 = Arc::clone(&fired);
    let timer = Event::new_timer(&reactor, false, move |_fd, res| {
        fired2.lock().unwrap().push(res);
    })
    .unwrap();
    timer
        .add(Some(Timeout::After(Duration::from_millis(50))))
        .unwrap();
    assert_eq!(reactor.event_count(), 1);

    let start = Instant::now();
    let outcome = reactor.dispatch(DispatchFlags::ONCE).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, DispatchOutcome::Completed);
    assert!(elapsed >= Duration::from_millis(50), "fired early: {elapsed:?}");
    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 1);
    assert!(fired[0].contains(EventMask::TIMEOUT));
    /* non-persistent: gone after firing */
    assert_eq!(reactor.event_count(), 0);
    assert!(!timer.pending(EventMask::TIMEOUT));
}

#[test]
fn persistent_read_with_timeout_interleaves() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let (r, w) = pipe_pair();
    let fired: Arc<Mutex<Vec<EventMask>>> = Arc::new(Mutex::new(Vec::new()));

    let fired2 = Arc::clone(&fired);
    let ev = Event::new(
        &reactor,
        Target::Fd(r),
        EventMask::READ | EventMask::PERSIST,
        move |fd, res| {
            if res.contains(EventMask::READ) {
                read_byte(fd);
            }
            fired2.lock().unwrap().push(res);
        },
    )
    .unwrap();
    ev.add(Some(Timeout::After(Duration::from_millis(100))))
        .unwrap();

    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        write_byte(w);
        w
    });

    reactor.loopexit(Some(Duration::from_millis(250))).unwrap();
    let outcome = reactor.dispatch(DispatchFlags::NONE).unwrap();
    assert_eq!(outcome, DispatchOutcome::Broken);
    assert!(reactor.got_exit());

    let w = writer.join().unwrap();
    let fired = fired.lock().unwrap();
    /* write at ~10ms, then timeouts at ~110ms and ~210ms */
    assert!(fired.len() >= 3, "expected >= 3 firings, got {fired:?}");
    assert!(fired[0].contains(EventMask::READ));
    assert!(
        fired[1..].iter().all(|m| m.contains(EventMask::TIMEOUT)),
        "later firings should be timeouts: {fired:?}"
    );

    ev.del().unwrap();
    close_fd(r);
    close_fd(w);
}

#[test]
fn persistent_timer_keeps_firing() {
    let reactor = Reactor::new().unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let count2 = Arc::clone(&count);
    let timer = Event::new_timer(&reactor, true, move |_fd, _res| {
        count2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    timer
        .add(Some(Timeout::After(Duration::from_millis(20))))
        .unwrap();

    reactor.loopexit(Some(Duration::from_millis(110))).unwrap();
    reactor.dispatch(DispatchFlags::NONE).unwrap();

    /* ~5 periods in 110ms; accept scheduler slop in both directions */
    let n = count.load(Ordering::SeqCst);
    assert!((3..=6).contains(&n), "expected ~5 firings, got {n}");
    /* still armed after loopexit */
    assert!(timer.pending(EventMask::TIMEOUT));
}

#[test]
fn zero_timeout_fires_immediately() {
    let reactor = Reactor::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    let timer = Event::new_timer(&reactor, false, move |_fd, _res| {
        fired2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    timer.add(Some(Timeout::After(Duration::ZERO))).unwrap();
    reactor.dispatch(DispatchFlags::NONBLOCK).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

/* ========================================================================= *
 * priorities
 * ========================================================================= */

#[test]
fn priority_zero_fires_before_priority_one() {
    let reactor = Reactor::new().unwrap();
    reactor.priority_init(2).unwrap();
    assert_eq!(reactor.npriorities(), 2);

    let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    let o = Arc::clone(&order);
    let low = Event::new_timer(&reactor, false, move |_fd, _res| {
        o.lock().unwrap().push(1);
    })
    .unwrap();
    low.set_priority(1).unwrap();

    let o = Arc::clone(&order);
    let high = Event::new_timer(&reactor, false, move |_fd, _res| {
        o.lock().unwrap().push(0);
    })
    .unwrap();
    high.set_priority(0).unwrap();

    /* activate in reverse priority order; dispatch must reorder */
    low.activate(EventMask::TIMEOUT, 1);
    high.activate(EventMask::TIMEOUT, 1);
    assert_eq!(reactor.active_count(), 2);

    reactor.dispatch(DispatchFlags::ONCE).unwrap();
    assert_eq!(*order.lock().unwrap(), vec![0, 1]);
}

#[test]
fn dispatch_callback_cap_still_runs_everything() {
    let mut cfg = ReactorConfig::new();
    cfg.max_dispatch_interval(None, Some(1), 0);
    let reactor = Reactor::with_config(&cfg).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let mut events = Vec::new();
    for _ in 0..4 {
        let count2 = Arc::clone(&count);
        let ev = Event::new_timer(&reactor, false, move |_fd, _res| {
            count2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        ev.activate(EventMask::TIMEOUT, 1);
        events.push(ev);
    }

    /* one callback per queue pass; the loop keeps going until drained */
    reactor.dispatch(DispatchFlags::ONCE).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 4);
}

#[test]
fn activate_later_runs_on_next_tick() {
    let reactor = Reactor::new().unwrap();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let o = Arc::clone(&order);
    let second = Arc::new(
        Event::new_timer(&reactor, false, move |_fd, _res| {
            o.lock().unwrap().push("second");
        })
        .unwrap(),
    );

    let o = Arc::clone(&order);
    let second2 = Arc::clone(&second);
    let first = Event::new_timer(&reactor, false, move |_fd, _res| {
        o.lock().unwrap().push("first");
        second2.activate_later(EventMask::TIMEOUT);
    })
    .unwrap();

    first.activate(EventMask::TIMEOUT, 1);
    reactor.dispatch(DispatchFlags::ONCE).unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

/* ========================================================================= *
 * signals
 * ========================================================================= */

#[test]
fn signal_coalescing_invokes_callback_per_delivery() {
    let reactor = Reactor::new().unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let count2 = Arc::clone(&count);
    let sig = Event::new_signal(&reactor, libc::SIGUSR1, move |fd, res| {
        assert_eq!(fd, libc::SIGUSR1);
        assert!(res.contains(EventMask::SIGNAL));
        count2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    sig.add(None).unwrap();

    for _ in 0..3 {
        // SAFETY: raising a signal we installed a handler for.
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
    }

    reactor.dispatch(DispatchFlags::NONBLOCK).unwrap();
    reactor.dispatch(DispatchFlags::NONBLOCK).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 3);

    sig.del().unwrap();
}

/* ========================================================================= *
 * cross-thread operations
 * ========================================================================= */

#[test]
fn loopbreak_from_other_thread_interrupts_wait() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let (r, w) = pipe_pair();

    /* an idle pipe keeps the loop waiting forever on its own */
    let ev = Event::new(
        &reactor,
        Target::Fd(r),
        EventMask::READ | EventMask::PERSIST,
        |_fd, _res| {},
    )
    .unwrap();
    ev.add(None).unwrap();

    let breaker = {
        let reactor = Arc::clone(&reactor);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            reactor.loopbreak();
        })
    };

    let start = Instant::now();
    let outcome = reactor.dispatch(DispatchFlags::NONE).unwrap();
    let elapsed = start.elapsed();
    breaker.join().unwrap();

    assert_eq!(outcome, DispatchOutcome::Broken);
    assert!(reactor.got_break());
    assert!(elapsed >= Duration::from_millis(50), "broke early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2000), "wake took {elapsed:?}");

    ev.del().unwrap();
    close_fd(r);
    close_fd(w);
}

#[test]
fn cross_thread_add_wakes_blocked_owner() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let (r, w) = pipe_pair();

    let ev = Event::new(
        &reactor,
        Target::Fd(r),
        EventMask::READ | EventMask::PERSIST,
        |_fd, _res| {},
    )
    .unwrap();
    ev.add(None).unwrap();

    let adder = {
        let reactor = Arc::clone(&reactor);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(40));
            let r2 = Arc::clone(&reactor);
            /* a zero timeout added from outside must wake the owner
             * promptly even though the pipe stays idle */
            reactor
                .once(Target::None, EventMask::NONE, None, move |_fd, _res| {
                    r2.loopbreak();
                })
                .unwrap();
        })
    };

    let start = Instant::now();
    reactor.dispatch(DispatchFlags::NONE).unwrap();
    let elapsed = start.elapsed();
    adder.join().unwrap();

    assert!(elapsed >= Duration::from_millis(40));
    assert!(
        elapsed < Duration::from_millis(2000),
        "cross-thread add did not wake the loop: {elapsed:?}"
    );

    ev.del().unwrap();
    close_fd(r);
    close_fd(w);
}

#[test]
fn del_block_waits_for_running_callback() {
    let reactor = Arc::new(Reactor::new().unwrap());

    let ev = Arc::new(
        Event::new_timer(&reactor, true, move |_fd, _res| {
            std::thread::sleep(Duration::from_millis(120));
        })
        .unwrap(),
    );
    ev.add(Some(Timeout::After(Duration::ZERO))).unwrap();

    let owner = {
        let reactor = Arc::clone(&reactor);
        std::thread::spawn(move || {
            reactor.dispatch(DispatchFlags::ONCE).unwrap();
        })
    };

    /* let the callback start, then delete from outside */
    std::thread::sleep(Duration::from_millis(40));
    let start = Instant::now();
    ev.del_block().unwrap();
    let waited = start.elapsed();
    owner.join().unwrap();

    assert!(
        waited >= Duration::from_millis(40),
        "del_block returned while the callback was still running: {waited:?}"
    );
    assert!(!ev.pending(EventMask::TIMEOUT));
}

/* ========================================================================= *
 * common timeouts
 * ========================================================================= */

#[test]
fn common_timeout_drains_thousand_events() {
    let reactor = Reactor::new().unwrap();
    let common = reactor
        .init_common_timeout(Duration::from_millis(200))
        .unwrap();
    /* same duration resolves to the same queue */
    assert_eq!(
        common,
        reactor
            .init_common_timeout(Duration::from_millis(200))
            .unwrap()
    );

    let count = Arc::new(AtomicUsize::new(0));
    let mut events = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let count2 = Arc::clone(&count);
        let ev = Event::new_timer(&reactor, false, move |_fd, res| {
            assert!(res.contains(EventMask::TIMEOUT));
            count2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        ev.add(Some(common)).unwrap();
        events.push(ev);
    }
    assert_eq!(reactor.event_count(), 1000);

    let start = Instant::now();
    let outcome = reactor.dispatch(DispatchFlags::NONE).unwrap();
    let elapsed = start.elapsed();

    /* loop drains every event and exits empty */
    assert_eq!(outcome, DispatchOutcome::NoPendingEvents);
    assert_eq!(count.load(Ordering::SeqCst), 1000);
    assert!(elapsed >= Duration::from_millis(200), "drained early: {elapsed:?}");
    assert_eq!(reactor.event_count(), 0);
}

#[test]
fn common_timeout_mixes_with_standalone_timers() {
    let reactor = Reactor::new().unwrap();
    let common = reactor
        .init_common_timeout(Duration::from_millis(60))
        .unwrap();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let o = Arc::clone(&order);
    let fast = Event::new_timer(&reactor, false, move |_fd, _res| {
        o.lock().unwrap().push("standalone-20ms");
    })
    .unwrap();
    fast.add(Some(Timeout::After(Duration::from_millis(20))))
        .unwrap();

    let o = Arc::clone(&order);
    let shared = Event::new_timer(&reactor, false, move |_fd, _res| {
        o.lock().unwrap().push("common-60ms");
    })
    .unwrap();
    shared.add(Some(common)).unwrap();

    reactor.dispatch(DispatchFlags::NONE).unwrap();
    assert_eq!(
        *order.lock().unwrap(),
        vec!["standalone-20ms", "common-60ms"]
    );
}

/* ========================================================================= *
 * one-shot helpers and loop control
 * ========================================================================= */

#[test]
fn once_with_io_fires_and_releases() {
    let reactor = Reactor::new().unwrap();
    let (r, w) = pipe_pair();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired2 = Arc::clone(&fired);
    reactor
        .once(Target::Fd(r), EventMask::READ, None, move |fd, res| {
            assert_eq!(fd, r);
            assert!(res.contains(EventMask::READ));
            fired2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(reactor.event_count(), 1);

    write_byte(w);
    reactor.dispatch(DispatchFlags::ONCE).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(reactor.event_count(), 0);

    close_fd(r);
    close_fd(w);
}

#[test]
fn once_zero_timeout_keeps_tick_ordering() {
    let reactor = Reactor::new().unwrap();
    let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    for i in 0..3u8 {
        let o = Arc::clone(&order);
        reactor
            .once(Target::None, EventMask::NONE, None, move |_fd, _res| {
                o.lock().unwrap().push(i);
            })
            .unwrap();
    }
    reactor.dispatch(DispatchFlags::NONBLOCK).unwrap();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn del_from_own_callback_is_safe() {
    let reactor = Reactor::new().unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let ev: Arc<Mutex<Option<Event>>> = Arc::new(Mutex::new(None));
    let ev2 = Arc::clone(&ev);
    let count2 = Arc::clone(&count);
    let timer = Event::new_timer(&reactor, true, move |_fd, _res| {
        count2.fetch_add(1, Ordering::SeqCst);
        /* a persistent event deleting itself mid-callback */
        if let Some(ev) = ev2.lock().unwrap().as_ref() {
            ev.del().unwrap();
        }
    })
    .unwrap();
    timer
        .add(Some(Timeout::After(Duration::from_millis(10))))
        .unwrap();
    *ev.lock().unwrap() = Some(timer);

    reactor.dispatch(DispatchFlags::NONE).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(reactor.event_count(), 0);
}

#[test]
fn finalizer_runs_after_removal() {
    let reactor = Reactor::new().unwrap();
    let finalized = Arc::new(AtomicUsize::new(0));

    let timer = Event::new_timer(&reactor, true, |_fd, _res| {}).unwrap();
    timer
        .add(Some(Timeout::After(Duration::from_secs(60))))
        .unwrap();
    assert_eq!(reactor.event_count(), 1);

    let finalized2 = Arc::clone(&finalized);
    timer
        .finalize(move || {
            finalized2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    /* the finalizer is deferred into the loop, not run inline */
    assert_eq!(finalized.load(Ordering::SeqCst), 0);
    reactor.dispatch(DispatchFlags::NONBLOCK).unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    assert_eq!(reactor.event_count(), 0);
}

#[test]
fn loopcontinue_restarts_priority_scan() {
    let reactor = Arc::new(Reactor::new().unwrap());
    reactor.priority_init(2).unwrap();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let o = Arc::clone(&order);
    let urgent = Arc::new(
        Event::new_timer(&reactor, false, move |_fd, _res| {
            o.lock().unwrap().push("urgent");
        })
        .unwrap(),
    );
    urgent.set_priority(0).unwrap();

    let o = Arc::clone(&order);
    let r2 = Arc::clone(&reactor);
    let urgent2 = Arc::clone(&urgent);
    let bulk_a = Event::new_timer(&reactor, false, move |_fd, _res| {
        o.lock().unwrap().push("bulk-a");
        /* activating something higher-priority mid-queue */
        urgent2.activate(EventMask::TIMEOUT, 1);
        r2.loopcontinue();
    })
    .unwrap();
    bulk_a.set_priority(1).unwrap();

    let o = Arc::clone(&order);
    let bulk_b = Event::new_timer(&reactor, false, move |_fd, _res| {
        o.lock().unwrap().push("bulk-b");
    })
    .unwrap();
    bulk_b.set_priority(1).unwrap();

    bulk_a.activate(EventMask::TIMEOUT, 1);
    bulk_b.activate(EventMask::TIMEOUT, 1);
    reactor.dispatch(DispatchFlags::ONCE).unwrap();

    /* urgent preempts bulk-b even though bulk-b was queued first */
    assert_eq!(*order.lock().unwrap(), vec!["bulk-a", "urgent", "bulk-b"]);
}

/* ========================================================================= *
 * fork recovery
 * ========================================================================= */

#[test]
#[ignore = "forks the process; run single-threaded: cargo test -- --ignored --test-threads=1"]
fn reinit_in_child_keeps_events_working() {
    let reactor = Reactor::new().unwrap();
    let (r, w) = pipe_pair();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired2 = Arc::clone(&fired);
    let ev = Event::new(
        &reactor,
        Target::Fd(r),
        EventMask::READ | EventMask::PERSIST,
        move |fd, _res| {
            read_byte(fd);
            fired2.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();
    ev.add(None).unwrap();

    // SAFETY: the child only uses the reactor and _exits; the parent waits.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        /* child: rebuild kernel state, prove the registration survived */
        let ok = reactor.reinit().is_ok() && {
            write_byte(w);
            reactor.dispatch(DispatchFlags::NONBLOCK).is_ok()
                && fired.load(Ordering::SeqCst) == 1
        };
        // SAFETY: _exit is the only safe way out of a forked test child.
        unsafe {
            libc::_exit(i32::from(!ok));
        }
    }
    let mut status = 0;
    // SAFETY: pid is our direct child.
    unsafe {
        libc::waitpid(pid, &raw mut status, 0);
    }
    assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);

    ev.del().unwrap();
    close_fd(r);
    close_fd(w);
}
