//! Context trackers.
//!
//! A context tracker threads a user-supplied value through every shift,
//! reduce, and reuse a stack performs. The value is opaque to the engine;
//! only its hash matters, as it partitions stacks that would otherwise look
//! equal and is written into the buffer so incremental reuse can tell
//! context-dependent regions apart.

use std::any::Any;
use std::rc::Rc;

use sylva_tree::Tree;

use crate::input::InputStream;

/// The opaque value a tracker maintains.
pub type ContextValue = Rc<dyn Any>;

/// The capability set of a context tracker.
///
/// All update hooks receive the term involved, the stack's current state,
/// and the input stream repositioned to where the update happens. The
/// default implementations keep the value unchanged.
pub trait ContextTracker {
    /// The value a fresh stack starts with.
    fn start(&self) -> ContextValue;

    /// Updates the value for a shifted term.
    fn shift(
        &self,
        context: &ContextValue,
        _term: u16,
        _state: u32,
        _input: &mut InputStream<'_>,
    ) -> ContextValue {
        Rc::clone(context)
    }

    /// Updates the value for a reduction.
    fn reduce(
        &self,
        context: &ContextValue,
        _term: u16,
        _state: u32,
        _input: &mut InputStream<'_>,
    ) -> ContextValue {
        Rc::clone(context)
    }

    /// Updates the value when a prebuilt subtree is reused.
    fn reuse(
        &self,
        context: &ContextValue,
        _tree: &Tree,
        _state: u32,
        _input: &mut InputStream<'_>,
    ) -> ContextValue {
        Rc::clone(context)
    }

    /// Hashes the value. Equal contexts must hash equally.
    fn hash(&self, context: &ContextValue) -> u32;

    /// Strict trackers flush a final context marker when a stack closes,
    /// so reuse across reparses can compare contexts exactly.
    fn strict(&self) -> bool {
        true
    }
}

/// The `(tracker, value, hash)` triple carried by a stack.
#[derive(Clone)]
pub struct StackContext {
    pub(crate) tracker: Rc<dyn ContextTracker>,
    pub(crate) context: ContextValue,
    pub(crate) hash: u32,
}

impl StackContext {
    /// Wraps a value, hashing it when the tracker is strict.
    #[must_use]
    pub fn new(tracker: Rc<dyn ContextTracker>, context: ContextValue) -> Self {
        let hash = if tracker.strict() {
            tracker.hash(&context)
        } else {
            0
        };
        Self {
            tracker,
            context,
            hash,
        }
    }

    /// The current opaque value.
    #[must_use]
    pub fn value(&self) -> &ContextValue {
        &self.context
    }

    /// The current hash.
    #[must_use]
    pub fn hash(&self) -> u32 {
        self.hash
    }
}

impl std::fmt::Debug for StackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackContext")
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Depth;

    impl ContextTracker for Depth {
        fn start(&self) -> ContextValue {
            Rc::new(0u32)
        }

        fn shift(
            &self,
            context: &ContextValue,
            term: u16,
            _state: u32,
            _input: &mut InputStream<'_>,
        ) -> ContextValue {
            let depth = *context.downcast_ref::<u32>().unwrap();
            match term {
                1 => Rc::new(depth + 1),
                2 => Rc::new(depth.saturating_sub(1)),
                _ => Rc::clone(context),
            }
        }

        fn hash(&self, context: &ContextValue) -> u32 {
            *context.downcast_ref::<u32>().unwrap()
        }
    }

    #[test]
    fn test_tracker_shift_and_hash() {
        let tracker: Rc<dyn ContextTracker> = Rc::new(Depth);
        let source = "()";
        let mut stream = InputStream::new(&source, Vec::new().into());
        let cx = StackContext::new(Rc::clone(&tracker), tracker.start());
        assert_eq!(cx.hash(), 0);
        let next = tracker.shift(cx.value(), 1, 0, &mut stream);
        let cx = StackContext::new(tracker, next);
        assert_eq!(cx.hash(), 1);
    }
}
