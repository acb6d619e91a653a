/*
 * proptest.rs
 *
 * Property-based tests: mask algebra, the event-count/pending invariants
 * under random operation sequences, and dispatch ordering laws. Timers in
 * the random-sequence tests are armed far in the future so nothing fires
 * and no test waits on the clock.
 */

use core::time::Duration;
use proptest::prelude::*;
use std::sync::{Arc, Mutex};

use evreactor::{DispatchFlags, Event, EventMask, Reactor, Timeout};

/* ============================================================================
 * EventMask algebra
 * ============================================================================ */

fn arb_mask() -> impl Strategy<Value = EventMask> {
    prop::sample::subsequence(
        vec![
            EventMask::TIMEOUT,
            EventMask::READ,
            EventMask::WRITE,
            EventMask::SIGNAL,
            EventMask::PERSIST,
            EventMask::ET,
            EventMask::CLOSED,
        ],
        0..=7,
    )
    .prop_map(|bits| bits.into_iter().fold(EventMask::NONE, |acc, b| acc | b))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn mask_union_contains_both(a in arb_mask(), b in arb_mask()) {
        let u = a | b;
        prop_assert!(u.contains(a));
        prop_assert!(u.contains(b));
        prop_assert_eq!(u.bits(), a.bits() | b.bits());
    }

    #[test]
    fn mask_intersection_is_symmetric(a in arb_mask(), b in arb_mask()) {
        prop_assert_eq!((a & b).bits(), (b & a).bits());
        prop_assert_eq!(a.intersects(b), b.intersects(a));
        prop_assert_eq!(a.intersects(b), !(a & b).is_empty());
    }

    #[test]
    fn mask_io_bits_subset(a in arb_mask()) {
        let io = a.io_bits();
        prop_assert!(a.contains(io));
        prop_assert!(!io.intersects(EventMask::TIMEOUT | EventMask::SIGNAL | EventMask::PERSIST));
    }
}

/* ============================================================================
 * flag invariants under random add/del sequences
 * ============================================================================ */

#[derive(Debug, Clone)]
enum Op {
    Add(usize),
    Del(usize),
    Tick,
}

fn arb_ops(nevents: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (0..nevents).prop_map(Op::Add),
            (0..nevents).prop_map(Op::Del),
            Just(Op::Tick),
        ],
        0..40,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /* event_count equals the number of events the model says are armed,
     * and pending() agrees, after any interleaving of add/del/dispatch */
    #[test]
    fn count_and_pending_match_model(ops in arb_ops(6)) {
        let reactor = Reactor::new().unwrap();
        let events: Vec<Event> = (0..6)
            .map(|_| Event::new_timer(&reactor, false, |_fd, _res| {}).unwrap())
            .collect();
        let mut armed = [false; 6];

        for op in ops {
            match op {
                Op::Add(i) => {
                    /* far future: never expires during the test */
                    events[i]
                        .add(Some(Timeout::After(Duration::from_secs(3600))))
                        .unwrap();
                    armed[i] = true;
                }
                Op::Del(i) => {
                    events[i].del().unwrap();
                    armed[i] = false;
                }
                Op::Tick => {
                    reactor.dispatch(DispatchFlags::NONBLOCK).unwrap();
                }
            }
            let expected = armed.iter().filter(|&&a| a).count();
            prop_assert_eq!(reactor.event_count(), expected);
            for (i, ev) in events.iter().enumerate() {
                prop_assert_eq!(ev.pending(EventMask::TIMEOUT), armed[i]);
            }
        }
    }

    /* re-adding is always allowed and keeps exactly one registration */
    #[test]
    fn repeated_add_keeps_single_registration(n in 1usize..10) {
        let reactor = Reactor::new().unwrap();
        let ev = Event::new_timer(&reactor, false, |_fd, _res| {}).unwrap();
        for _ in 0..n {
            ev.add(Some(Timeout::After(Duration::from_secs(600)))).unwrap();
        }
        prop_assert_eq!(reactor.event_count(), 1);
        ev.del().unwrap();
        prop_assert_eq!(reactor.event_count(), 0);
    }
}

/* ============================================================================
 * dispatch ordering laws
 * ============================================================================ */

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /* whatever order events are activated in, callbacks run in priority
     * order, FIFO within a priority */
    #[test]
    fn activation_respects_priorities(pris in prop::collection::vec(0u8..4, 1..12)) {
        let reactor = Reactor::new().unwrap();
        reactor.priority_init(4).unwrap();
        let order: Arc<Mutex<Vec<(u8, usize)>>> = Arc::new(Mutex::new(Vec::new()));

        let mut events = Vec::new();
        for (seq, &pri) in pris.iter().enumerate() {
            let o = Arc::clone(&order);
            let ev = Event::new_timer(&reactor, false, move |_fd, _res| {
                o.lock().unwrap().push((pri, seq));
            })
            .unwrap();
            ev.set_priority(pri).unwrap();
            ev.activate(EventMask::TIMEOUT, 1);
            events.push(ev);
        }

        reactor.dispatch(DispatchFlags::ONCE).unwrap();

        let fired = order.lock().unwrap();
        prop_assert_eq!(fired.len(), pris.len());
        /* sorted by priority, stable in activation order within one */
        let mut expected: Vec<(u8, usize)> =
            pris.iter().copied().enumerate().map(|(s, p)| (p, s)).collect();
        expected.sort_by_key(|&(p, s)| (p, s));
        prop_assert_eq!(fired.clone(), expected);
    }

    /* expired timers fire in deadline order */
    #[test]
    fn expired_timers_fire_in_deadline_order(
        mut delays in prop::collection::vec(0u64..25, 2..8)
    ) {
        delays.sort_unstable();
        delays.dedup();
        prop_assume!(delays.len() >= 2);

        let reactor = Reactor::new().unwrap();
        let order: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let mut events = Vec::new();
        /* arm in reverse so insertion order disagrees with deadline order */
        for &ms in delays.iter().rev() {
            let o = Arc::clone(&order);
            let ev = Event::new_timer(&reactor, false, move |_fd, _res| {
                o.lock().unwrap().push(ms);
            })
            .unwrap();
            ev.add(Some(Timeout::After(Duration::from_millis(ms)))).unwrap();
            events.push(ev);
        }

        /* let every deadline pass, then drain in one nonblocking pass */
        std::thread::sleep(Duration::from_millis(30));
        reactor.dispatch(DispatchFlags::NONBLOCK).unwrap();

        let fired = order.lock().unwrap();
        prop_assert_eq!(fired.clone(), delays);
    }

    /* common-timeout tokens are deduplicated by duration */
    #[test]
    fn common_timeout_token_identity(durs in prop::collection::vec(1u64..50, 1..20)) {
        let reactor = Reactor::new().unwrap();
        let mut tokens = std::collections::HashMap::new();
        for &ms in &durs {
            let tok = reactor
                .init_common_timeout(Duration::from_millis(ms))
                .unwrap();
            match tokens.get(&ms) {
                Some(prev) => prop_assert_eq!(*prev, tok),
                None => {
                    tokens.insert(ms, tok);
                }
            }
        }
    }
}
