//! A bounded, zero-buffered rendezvous primitive.
//!
//! Unlike an unbounded channel, a pusher queued here can still be aborted
//! by [`Waker::stop`]; unlike a bare condition variable, a hand-off
//! atomically transports a payload. Scan workers use it to hand resource
//! events to the main thread, and the worker pool uses it to hand jobs to
//! its workers.

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex};

use crate::{Error, Result};

pub struct Waker<P> {
    state: Mutex<State<P>>,
    push_cond: Condvar,
    receive_cond: Condvar,
}

struct State<P> {
    stopped: bool,
    next_token: u64,
    /// Payloads whose pusher is still blocked waiting for a receiver.
    pending: VecDeque<(u64, P)>,
    /// Tokens whose payload was taken; the pusher unblocks on sight.
    delivered: HashSet<u64>,
    /// Payload copies owed to the receivers that were waiting when a
    /// broadcast fired.
    broadcasts: VecDeque<P>,
    waiting_receivers: usize,
}

impl<P> Waker<P> {
    pub fn new() -> Waker<P> {
        Waker {
            state: Mutex::new(State {
                stopped: false,
                next_token: 0,
                pending: VecDeque::new(),
                delivered: HashSet::new(),
                broadcasts: VecDeque::new(),
                waiting_receivers: 0,
            }),
            push_cond: Condvar::new(),
            receive_cond: Condvar::new(),
        }
    }

    pub fn did_stop(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    /// Deliver `payload` to a receiver, blocking until one takes it.
    /// Fails with [`Error::WakerStopped`] if the waker stops first, even
    /// when the payload was already taken.
    pub fn push(&self, payload: P) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return Err(Error::WakerStopped);
        }
        let token = state.next_token;
        state.next_token += 1;
        state.pending.push_back((token, payload));
        self.receive_cond.notify_one();

        loop {
            if state.stopped {
                state.pending.retain(|(t, _)| *t != token);
                state.delivered.remove(&token);
                return Err(Error::WakerStopped);
            }
            if state.delivered.remove(&token) {
                return Ok(());
            }
            state = self.push_cond.wait(state).unwrap();
        }
    }

    /// Return the next pushed payload, blocking until one arrives.
    pub fn receive(&self) -> Result<P> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopped {
                return Err(Error::WakerStopped);
            }
            if let Some(payload) = state.broadcasts.pop_front() {
                return Ok(payload);
            }
            if let Some((token, payload)) = state.pending.pop_front() {
                state.delivered.insert(token);
                self.push_cond.notify_all();
                return Ok(payload);
            }
            state.waiting_receivers += 1;
            state = self.receive_cond.wait(state).unwrap();
            state.waiting_receivers -= 1;
        }
    }

    /// Wake every receiver currently waiting with its own payload; does
    /// nothing when none is waiting. Blocked pushers are unaffected.
    pub fn broadcast_with(&self, mut payload: impl FnMut() -> P) {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return;
        }
        for _ in 0..state.waiting_receivers {
            let payload = payload();
            state.broadcasts.push_back(payload);
        }
        if state.waiting_receivers > 0 {
            self.receive_cond.notify_all();
        }
    }

    /// Transition to the terminal state: every blocked push and receive
    /// wakes with [`Error::WakerStopped`], and both calls fail afterwards.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return;
        }
        state.stopped = true;
        state.pending.clear();
        state.broadcasts.clear();
        state.delivered.clear();
        self.push_cond.notify_all();
        self.receive_cond.notify_all();
    }
}
