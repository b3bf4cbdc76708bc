//! TX context pool
//!
//! A [`TxContext`] tracks one frame handed to the controller whose sender
//! asked for a completion callback. Frames without a callback are only
//! counted, on the newest tracked context or on the connection itself.

use crate::buf::NetBuf;
use crate::conn::frag::Fragmenter;
use crate::conn::table::ConnRef;
use crate::error::{ConnError, ConnResult};
use std::cell::Cell;
use std::fmt;
use std::sync::{Condvar, Mutex};

/// Completion callback for an outbound buffer
pub type TxCallback = Box<dyn FnOnce(&ConnRef, ConnResult<()>) + Send + 'static>;

thread_local! {
    static IN_COMPLETION: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is running TX completion callbacks
pub fn in_completion_context() -> bool {
    IN_COMPLETION.with(|flag| flag.get())
}

/// Marks the current thread as the completion context until dropped
pub struct CompletionScope {
    previous: bool,
}

impl CompletionScope {
    pub fn enter() -> Self {
        let previous = IN_COMPLETION.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for CompletionScope {
    fn drop(&mut self) {
        let previous = self.previous;
        IN_COMPLETION.with(|flag| flag.set(previous));
    }
}

/// One pending transmission record
pub struct TxContext {
    id: usize,
    cb: Option<TxCallback>,
    /// Callback-less frames sent after this one
    pub pending_no_cb: usize,
}

impl TxContext {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn set_callback(&mut self, cb: TxCallback) {
        self.cb = Some(cb);
    }

    pub fn take_callback(&mut self) -> Option<TxCallback> {
        self.cb.take()
    }

    pub fn has_callback(&self) -> bool {
        self.cb.is_some()
    }
}

impl fmt::Debug for TxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxContext")
            .field("id", &self.id)
            .field("has_cb", &self.cb.is_some())
            .field("pending_no_cb", &self.pending_no_cb)
            .finish()
    }
}

/// An outbound buffer queued on a connection
pub struct TxItem {
    pub buf: NetBuf,
    pub ctx: Option<TxContext>,
}

/// A queued buffer whose fragments are partly handed to the controller
///
/// Parked here when the controller runs out of buffers halfway through.
pub struct TxInProgress {
    pub frags: Fragmenter,
    /// Travels with the last fragment
    pub ctx: Option<TxContext>,
}

/// Fixed-capacity free list of TX contexts
pub struct TxPool {
    capacity: usize,
    free: Mutex<Vec<TxContext>>,
    cond: Condvar,
}

impl TxPool {
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity)
            .rev()
            .map(|id| TxContext {
                id,
                cb: None,
                pending_no_cb: 0,
            })
            .collect();
        Self {
            capacity,
            free: Mutex::new(free),
            cond: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Take a context from the free list
    ///
    /// From the completion context only a non-blocking attempt is made,
    /// since that context is the one returning contexts to the pool.
    pub fn acquire(&self, blocking: bool) -> ConnResult<TxContext> {
        let blocking = blocking && !in_completion_context();
        let mut free = self.free.lock().unwrap();
        if blocking {
            while free.is_empty() {
                free = self.cond.wait(free).unwrap();
            }
        }
        free.pop().ok_or(ConnError::OutOfTxContexts)
    }

    /// Clear a context and return it to the free list
    pub fn retire(&self, mut ctx: TxContext) {
        ctx.cb = None;
        ctx.pending_no_cb = 0;
        let mut free = self.free.lock().unwrap();
        debug_assert!(free.len() < self.capacity);
        free.push(ctx);
        self.cond.notify_one();
    }
}

impl fmt::Debug for TxPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxPool")
            .field("capacity", &self.capacity)
            .field("free", &self.free_count())
            .finish()
    }
}
