//! Loopback mesh stack
//!
//! Stands in for the radio: accepts the composition, hands out advertising
//! buffers from a fixed pool and records what was sent. Buffers come back
//! when the transport drains, which the daemon does on a timer.

use meshnode_core::{Composition, MeshStack, MessageContext, SlotRef, StackError};
use meshnode_protocol::{requires_segmentation, Address, Opcode};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// A message accepted by the loopback stack
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub slot: SlotRef,
    pub destination: Address,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub segmented: bool,
}

/// Transport counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportStats {
    pub sent: u64,
    pub segmented: u64,
    pub dropped: u64,
    pub in_flight: usize,
}

pub struct LoopbackStack {
    pool_size: usize,
    in_flight: AtomicUsize,
    registered: AtomicBool,
    model_count: AtomicUsize,
    sent: AtomicU64,
    segmented: AtomicU64,
    dropped: AtomicU64,
    log_capacity: usize,
    log: Mutex<VecDeque<SentMessage>>,
}

impl LoopbackStack {
    pub fn new(pool_size: usize, log_capacity: usize) -> Self {
        Self {
            pool_size,
            in_flight: AtomicUsize::new(0),
            registered: AtomicBool::new(false),
            model_count: AtomicUsize::new(0),
            sent: AtomicU64::new(0),
            segmented: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            log_capacity,
            log: Mutex::new(VecDeque::with_capacity(log_capacity)),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Models in the registered composition
    pub fn model_count(&self) -> usize {
        self.model_count.load(Ordering::SeqCst)
    }

    /// Return every in-flight buffer to the pool
    pub fn drain(&self) -> usize {
        let released = self.in_flight.swap(0, Ordering::SeqCst);
        if released > 0 {
            trace!("Transport drained {} buffers", released);
        }
        released
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            sent: self.sent.load(Ordering::SeqCst),
            segmented: self.segmented.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Most recent sends, oldest first
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.lock_log().iter().cloned().collect()
    }

    fn lock_log(&self) -> MutexGuard<'_, VecDeque<SentMessage>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_buffer(&self) -> Result<(), StackError> {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.pool_size).then_some(used + 1)
            })
            .map(|_| ())
            .map_err(|_| StackError::NoBuffers)
    }
}

impl MeshStack for LoopbackStack {
    fn register(&self, composition: &Composition) -> Result<(), StackError> {
        if self.registered.swap(true, Ordering::SeqCst) {
            return Err(StackError::AlreadyRegistered);
        }
        self.model_count
            .store(composition.model_count(), Ordering::SeqCst);
        debug!(
            "Loopback stack registered {} models ({} bytes of page 0)",
            composition.model_count(),
            composition.page0().len()
        );
        Ok(())
    }

    fn send(
        &self,
        slot: SlotRef,
        ctx: &MessageContext,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), StackError> {
        if !self.is_registered() {
            return Err(StackError::NotRegistered);
        }
        if let Err(e) = self.take_buffer() {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }

        let segmented = requires_segmentation(opcode.len() + payload.len());
        self.sent.fetch_add(1, Ordering::SeqCst);
        if segmented {
            self.segmented.fetch_add(1, Ordering::SeqCst);
        }
        trace!(
            "{} -> {} opcode {} [{}]{}",
            slot,
            ctx.addr,
            opcode,
            hex::encode(payload),
            if segmented { " (segmented)" } else { "" }
        );

        if self.log_capacity > 0 {
            let mut log = self.lock_log();
            if log.len() == self.log_capacity {
                log.pop_front();
            }
            log.push_back(SentMessage {
                slot,
                destination: ctx.addr,
                opcode,
                payload: payload.to_vec(),
                segmented,
            });
        }
        Ok(())
    }
}
