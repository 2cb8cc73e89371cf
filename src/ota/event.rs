//! Event word and timer plumbing for the threaded agent.
//!
//! The worker's single wait site is an event word: a 32-bit flag set guarded
//! by a mutex/condvar pair. Timers, the public API (`stop`,
//! `get_update_now`) and transport code all communicate with the worker by
//! setting bits; the worker waits for any bit of interest with a timeout
//! derived from the nearest timer deadline.
//!
//! Timers are deadline-based rather than thread-based: arming a timer
//! records `(deadline, event)`, and whoever is pumping the session fires
//! expired deadlines into the event word. Download loops call
//! [`Timers::fire_expired`] between chunks so phase watchdogs can abort a
//! transfer that no longer waits on the event word.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Event bits delivered through the [`EventWord`].
pub mod bits {
    /// Agent shutdown requested.
    pub const SHUTDOWN_NOW: u32 = 1 << 1;
    /// Start an update session (initial/next/retry timer or
    /// `get_update_now`).
    pub const START_UPDATE: u32 = 1 << 2;
    /// A data payload arrived.
    pub const GOT_DATA: u32 = 1 << 3;
    /// The whole image has been received.
    pub const DATA_DONE: u32 = 1 << 4;
    /// Disconnect requested.
    pub const DISCONNECT: u32 = 1 << 5;
    /// The per-packet watchdog fired.
    pub const PACKET_TIMEOUT: u32 = 1 << 6;
    /// The job/data phase watchdog fired.
    pub const DOWNLOAD_TIMEOUT: u32 = 1 << 7;
    /// A storage operation failed mid-download.
    pub const STORAGE_ERROR: u32 = 1 << 8;
    /// A payload advertised a version that is not newer.
    pub const INVALID_VERSION: u32 = 1 << 9;
    /// The job document failed to parse.
    pub const MALFORMED_JOB: u32 = 1 << 10;
    /// Data failure (verification or write).
    pub const DATA_FAIL: u32 = 1 << 11;
    /// The broker/server dropped the connection.
    pub const DROPPED_US: u32 = 1 << 12;
    /// The application callback stopped the session mid-download.
    pub const APP_STOPPED: u32 = 1 << 13;

    /// Bits that abort an in-flight download phase.
    pub const DOWNLOAD_ABORT: u32 =
        SHUTDOWN_NOW | PACKET_TIMEOUT | DOWNLOAD_TIMEOUT | STORAGE_ERROR | INVALID_VERSION
            | DATA_FAIL | DROPPED_US | APP_STOPPED;
}

/// A 32-bit event flag set with blocking waits.
///
/// `set` may be called from any thread; `wait_any` and `take` clear and
/// return the matched bits.
#[derive(Debug, Default)]
pub struct EventWord {
    state: Mutex<u32>,
    cond: Condvar,
}

impl EventWord {
    /// An empty event word.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bits and wake any waiter.
    pub fn set(&self, bits: u32) {
        let mut state = self.state.lock().unwrap();
        *state |= bits;
        self.cond.notify_all();
    }

    /// Clear bits without waking anyone.
    pub fn clear(&self, mask: u32) {
        let mut state = self.state.lock().unwrap();
        *state &= !mask;
    }

    /// Return whichever bits of `mask` are currently set, leaving them set.
    ///
    /// Used for bits someone else must still see (a shutdown request
    /// observed mid-download still has to reach the main wait).
    pub fn peek(&self, mask: u32) -> u32 {
        let state = self.state.lock().unwrap();
        *state & mask
    }

    /// Clear and return whichever bits of `mask` are currently set, without
    /// blocking.
    pub fn take(&self, mask: u32) -> u32 {
        let mut state = self.state.lock().unwrap();
        let hits = *state & mask;
        *state &= !hits;
        hits
    }

    /// Block until any bit of `mask` is set or the timeout elapses; the
    /// matched bits are cleared and returned (0 on timeout).
    pub fn wait_any(&self, mask: u32, timeout: Option<Duration>) -> u32 {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            let hits = *state & mask;
            if hits != 0 {
                *state &= !hits;
                return hits;
            }
            match deadline {
                None => {
                    state = self.cond.wait(state).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return 0;
                    }
                    let (guard, _timeout) =
                        self.cond.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
    }
}

/// A monotonic millisecond clock.
///
/// Sessions take the clock as a trait so tests can drive timer expiry
/// deterministically.
pub trait Clock {
    /// Milliseconds from an arbitrary fixed origin.
    fn now_ms(&self) -> u64;
}

/// Wall-clock backed [`Clock`].
#[derive(Debug, Clone)]
pub struct StdClock {
    origin: Instant,
}

impl Default for StdClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl StdClock {
    /// A clock starting at zero now.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for StdClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Maximum number of concurrently armed timers.
const MAX_TIMERS: usize = 4;

#[derive(Debug, Clone, Copy)]
struct TimerSlot {
    deadline_ms: u64,
    event: u32,
}

/// Single-shot, deadline-based timers delivering event bits.
///
/// Arming a timer for an event that already has one replaces the old
/// deadline, matching reused RTOS timers.
#[derive(Debug, Default)]
pub struct Timers {
    slots: heapless::Vec<TimerSlot, MAX_TIMERS>,
}

impl Timers {
    /// No timers armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer delivering `event` after `secs` seconds.
    pub fn arm(&mut self, now_ms: u64, secs: u32, event: u32) {
        self.cancel(event);
        let slot = TimerSlot {
            deadline_ms: now_ms + u64::from(secs) * 1000,
            event,
        };
        // Capacity bounds the number of distinct events; an overflow would
        // mean a new event class was added without growing MAX_TIMERS.
        let _ = self.slots.push(slot);
    }

    /// Cancel the timer delivering `event`, if armed.
    pub fn cancel(&mut self, event: u32) {
        self.slots.retain(|slot| slot.event != event);
    }

    /// Cancel everything.
    pub fn cancel_all(&mut self) {
        self.slots.clear();
    }

    /// The nearest armed deadline.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.slots.iter().map(|slot| slot.deadline_ms).min()
    }

    /// Milliseconds until the nearest deadline (zero if already due).
    pub fn until_next(&self, now_ms: u64) -> Option<Duration> {
        self.next_deadline_ms()
            .map(|deadline| Duration::from_millis(deadline.saturating_sub(now_ms)))
    }

    /// Fire every expired timer into the event word.
    pub fn fire_expired(&mut self, now_ms: u64, events: &EventWord) {
        let mut fired = 0u32;
        self.slots.retain(|slot| {
            if slot.deadline_ms <= now_ms {
                fired |= slot.event;
                false
            } else {
                true
            }
        });
        if fired != 0 {
            events.set(fired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_take() {
        let events = EventWord::new();
        events.set(bits::START_UPDATE | bits::GOT_DATA);
        assert_eq!(events.take(bits::START_UPDATE), bits::START_UPDATE);
        // Taken bits are cleared, others remain.
        assert_eq!(events.take(bits::START_UPDATE), 0);
        assert_eq!(events.take(bits::GOT_DATA), bits::GOT_DATA);
    }

    #[test]
    fn wait_any_times_out() {
        let events = EventWord::new();
        let hits = events.wait_any(bits::START_UPDATE, Some(Duration::from_millis(10)));
        assert_eq!(hits, 0);
    }

    #[test]
    fn wait_any_sees_cross_thread_set() {
        let events = std::sync::Arc::new(EventWord::new());
        let setter = events.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set(bits::SHUTDOWN_NOW);
        });
        let hits = events.wait_any(bits::SHUTDOWN_NOW, Some(Duration::from_secs(5)));
        assert_eq!(hits, bits::SHUTDOWN_NOW);
        handle.join().unwrap();
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let events = EventWord::new();
        let mut timers = Timers::new();
        timers.arm(0, 10, bits::START_UPDATE);
        timers.arm(0, 5, bits::DOWNLOAD_TIMEOUT);

        assert_eq!(timers.next_deadline_ms(), Some(5_000));

        timers.fire_expired(5_000, &events);
        assert_eq!(events.take(u32::MAX), bits::DOWNLOAD_TIMEOUT);
        assert_eq!(timers.next_deadline_ms(), Some(10_000));

        timers.fire_expired(10_000, &events);
        assert_eq!(events.take(u32::MAX), bits::START_UPDATE);
        assert_eq!(timers.next_deadline_ms(), None);
    }

    #[test]
    fn rearming_replaces_deadline() {
        let mut timers = Timers::new();
        timers.arm(0, 10, bits::PACKET_TIMEOUT);
        timers.arm(2_000, 10, bits::PACKET_TIMEOUT);
        assert_eq!(timers.next_deadline_ms(), Some(12_000));
    }

    #[test]
    fn cancel_removes_slot() {
        let events = EventWord::new();
        let mut timers = Timers::new();
        timers.arm(0, 5, bits::DOWNLOAD_TIMEOUT);
        timers.cancel(bits::DOWNLOAD_TIMEOUT);
        timers.fire_expired(u64::MAX, &events);
        assert_eq!(events.take(u32::MAX), 0);
    }
}
