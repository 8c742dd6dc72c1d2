//! The single global critical section.
//!
//! The platform has exactly one coordination primitive: masking the one
//! interrupt source. [`enter`] models the save/restore pattern — it is
//! re-entrant, so the ring queue can take the mask inside a setter that
//! already holds it. [`Shared`] is an interrupt-mask-protected cell; its
//! `with` closure is the only access path to state shared between the
//! timer context and foreground command processing.
//!
//! Nested `with` on the *same* cell would alias the `&mut` and is a
//! caller error; it is trapped and halts deliberately rather than
//! corrupting shared buffers.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether the interrupt source is currently masked.
static MASKED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Per-context mask depth (save/restore nesting).
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Mask the interrupt source; restored when the guard drops.
///
/// Re-entrant within one context: only the outermost guard actually
/// toggles the mask, inner guards just track depth.
pub fn enter() -> MaskGuard {
    DEPTH.with(|depth| {
        if depth.get() == 0 {
            while MASKED
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                std::hint::spin_loop();
            }
        }
        depth.set(depth.get() + 1);
    });
    MaskGuard {
        _not_send: std::marker::PhantomData,
    }
}

/// Restores the previous mask state on drop.
#[must_use = "the mask is released as soon as the guard drops"]
pub struct MaskGuard {
    // The guard must be dropped in the context that created it.
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| {
            depth.set(depth.get() - 1);
            if depth.get() == 0 {
                MASKED.store(false, Ordering::Release);
            }
        });
    }
}

/// An interrupt-mask-protected cell.
///
/// All access goes through [`Shared::with`], which holds the mask for
/// the span of the closure. Do not call `with` on the same cell from
/// inside its own closure.
pub struct Shared<T> {
    borrowed: AtomicBool,
    cell: UnsafeCell<T>,
}

// SAFETY: every access is serialized by the global mask plus the
// `borrowed` re-entrancy trap.
unsafe impl<T: Send> Sync for Shared<T> {}
unsafe impl<T: Send> Send for Shared<T> {}

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self {
            borrowed: AtomicBool::new(false),
            cell: UnsafeCell::new(value),
        }
    }

    /// Run `f` with exclusive access under the mask.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _guard = enter();
        if self.borrowed.swap(true, Ordering::Relaxed) {
            // Re-entry would hand out a second `&mut` to the same state.
            panic!("re-entrant access to a Shared cell");
        }
        // SAFETY: the mask is held and the re-entrancy trap passed, so
        // no other reference to the contents exists.
        let result = f(unsafe { &mut *self.cell.get() });
        self.borrowed.store(false, Ordering::Relaxed);
        result
    }

    /// Consume the cell and return the contents.
    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn mask_is_reentrant() {
        let outer = enter();
        let inner = enter();
        drop(inner);
        // Still held: the inner guard must not have released it.
        assert!(MASKED.load(Ordering::Relaxed));
        drop(outer);
        // Would deadlock here if the outer drop had not released.
        drop(enter());
    }

    #[test]
    fn shared_serializes_two_contexts() {
        let shared = Arc::new(Shared::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let shared = shared.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1_000 {
                    shared.with(|count| *count += 1);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(shared.with(|count| *count), 4_000);
    }

    #[test]
    fn nested_distinct_cells_are_fine() {
        let a = Shared::new(1u16);
        let b = Shared::new(2u16);
        let sum = a.with(|a| b.with(|b| *a + *b));
        assert_eq!(sum, 3);
    }

    #[test]
    #[should_panic(expected = "re-entrant access")]
    fn reentrant_shared_access_traps() {
        let shared = Shared::new(0u8);
        shared.with(|_| {
            shared.with(|_| {});
        });
    }
}
