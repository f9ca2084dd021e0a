//! Per-thread reentrancy guard for intercepted calls.
//!
//! One logical access often fans out into several intercepted primitives on
//! the same thread (an `open` that stats, a report write that itself opens a
//! file). Only the outermost of those is arbitrated; everything it triggers is
//! passed through untouched.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Nesting depth of intercepted calls on the current thread.
///
/// Returns 0 once the thread's local storage has been torn down.
pub fn current_depth() -> usize {
    DEPTH.try_with(Cell::get).unwrap_or(0)
}

/// Scoped token marking one level of intercepted-call nesting.
///
/// Dropping the token (on return, early exit or unwind) undoes the
/// increment made by [`enter`](ReentrancyGuard::enter). The token is
/// `!Send`, so it is always released on the thread that took it.
#[derive(Debug)]
#[must_use = "the nesting level is released as soon as the guard is dropped"]
pub struct ReentrancyGuard {
    depth: usize,
    _thread_bound: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Enter one level of nesting on the calling thread.
    pub fn enter() -> Self {
        let depth = DEPTH
            .try_with(|d| {
                let next = d.get().saturating_add(1);
                d.set(next);
                next
            })
            // Without thread-local storage every call looks outermost, so
            // late accesses during thread exit are still arbitrated.
            .unwrap_or(1);
        Self {
            depth,
            _thread_bound: PhantomData,
        }
    }

    /// Depth this guard was entered at (1 for the outermost call).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether this is the only active level on the thread.
    ///
    /// Checked against the live counter rather than the entry depth, so a
    /// guard held while a nested guard is alive reports `false`.
    pub fn is_outermost(&self) -> bool {
        DEPTH.try_with(|d| d.get() == 1).unwrap_or(true)
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = DEPTH.try_with(|d| d.set(d.get().saturating_sub(1)));
    }
}
