//! Trace and span id generation.

use crate::trace::{SpanId, TraceId};
use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Interface for generating the ids assigned to new spans.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new `TraceId`.
    fn new_trace_id(&self) -> TraceId;

    /// Generate a new `SpanId`.
    fn new_span_id(&self) -> SpanId;
}

impl IdGenerator for Box<dyn IdGenerator> {
    fn new_trace_id(&self) -> TraceId {
        (**self).new_trace_id()
    }

    fn new_span_id(&self) -> SpanId {
        (**self).new_span_id()
    }
}

/// Default [`IdGenerator`], generating ids from a thread-local PRNG.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| {
            let mut rng = rng.borrow_mut();
            loop {
                let id = TraceId::from_u128(rng.gen());
                if id != TraceId::INVALID {
                    return id;
                }
            }
        })
    }

    fn new_span_id(&self) -> SpanId {
        CURRENT_RNG.with(|rng| {
            let mut rng = rng.borrow_mut();
            loop {
                let id = SpanId::from_u64(rng.gen());
                if id != SpanId::INVALID {
                    return id;
                }
            }
        })
    }
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

/// Deterministic [`IdGenerator`] for tests, assigning sequential ids.
#[derive(Debug, Default)]
pub struct IncrementIdGenerator {
    next_trace_id: AtomicU64,
    next_span_id: AtomicU64,
}

impl IncrementIdGenerator {
    /// Create a generator whose first trace id and span id are both 1.
    pub fn new() -> Self {
        IncrementIdGenerator::default()
    }
}

impl IdGenerator for IncrementIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        TraceId::from_u128(self.next_trace_id.fetch_add(1, Ordering::Relaxed) as u128 + 1)
    }

    fn new_span_id(&self) -> SpanId {
        SpanId::from_u64(self.next_span_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
