/*
 * lib.rs
 *
 * Event-notification core. One reactor multiplexes readiness on file
 * descriptors, UNIX signals, and time, and runs user callbacks in priority
 * order when any of them fire. Everything above this - buffered streams,
 * protocol handling, listeners - belongs to other crates.
 *
 * Layering, leaves first: clock -> minheap -> evmap -> backends ->
 * signal/notify plumbing -> reactor. The reactor module owns the loop;
 * event carries the public handle.
 */

//! # evreactor
//!
//! A reactor core: register interest in fd readiness, signal delivery, or
//! a timeout, and get your callback invoked from one dispatch loop.
//!
//! ## Quick Start
//!
//! ```no_run
//! use core::time::Duration;
//! use evreactor::{DispatchFlags, Event, EventMask, Reactor, Timeout};
//!
//! let reactor = Reactor::new().unwrap();
//! let timer = Event::new_timer(&reactor, false, |_fd, res| {
//!     assert!(res.contains(EventMask::TIMEOUT));
//! })
//! .unwrap();
//! timer.add(Some(Timeout::After(Duration::from_millis(50)))).unwrap();
//! reactor.dispatch(DispatchFlags::ONCE).unwrap();
//! ```
//!
//! The kernel primitive (epoll, kqueue, or poll) is picked at construction;
//! see [`ReactorConfig`] for steering that choice, and
//! [`Reactor::init_common_timeout`] for the shared-duration fast path when
//! thousands of events carry the same timeout.

pub mod backend;
mod clock;
pub mod config;
pub mod debug;
mod epoll;
pub mod error;
pub mod event;
mod evmap;
mod kqueue;
mod minheap;
mod notify;
mod poll;
mod reactor;
mod signal;

pub use backend::supported_methods;
pub use config::{ConfigFlags, ReactorConfig};
pub use debug::enable_debug_mode;
pub use error::{ReactorError, Result};
pub use event::{CommonTimeout, Event, EventMask, Target, Timeout};
pub use reactor::{DispatchFlags, DispatchOutcome, Reactor};
