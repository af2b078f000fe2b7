//! Shared/weak ownership between the isolate, its contexts and the holders
//! they hand out.
//!
//! `Arc` is the shared reference and `std::sync::Weak` the weak one. Promotion
//! with `Weak::upgrade` refuses once the strong count has reached zero, which
//! is exactly the window in which the target's `Drop` is running, so a holder
//! can never resurrect an isolate or context that is being torn down.
//!
//! ```text
//!   V8Isolate ──Arc──► IsolateInner ◄──Arc── ContextInner ◄──Arc── V8Context
//!                          ▲                      ▲
//!                          └──── Weak ────┬─ Weak ┘
//!                                    WeakBinding  (inside every holder)
//! ```

use std::sync::{Arc, Weak};

use crate::context::ContextInner;
use crate::error::{ENGINE_DESTROYED, Error};
use crate::isolate::IsolateInner;

/// Observes an isolate and one of its contexts without keeping either alive.
#[derive(Clone)]
pub(crate) struct WeakBinding {
    isolate: Weak<IsolateInner>,
    context: Weak<ContextInner>,
    isolate_id: u64,
}

impl WeakBinding {
    pub(crate) fn new(context: &ContextInner) -> Self {
        Self {
            isolate: Arc::downgrade(&context.isolate),
            context: context.weak_self.clone(),
            isolate_id: context.isolate.id,
        }
    }

    /// Bound to the isolate only; `context()` always fails.
    pub(crate) fn isolate_only(isolate: &Arc<IsolateInner>) -> Self {
        Self {
            isolate: Arc::downgrade(isolate),
            context: Weak::new(),
            isolate_id: isolate.id,
        }
    }

    pub(crate) fn isolate(&self) -> Option<Arc<IsolateInner>> {
        self.isolate.upgrade()
    }

    pub(crate) fn context(&self) -> Option<Arc<ContextInner>> {
        self.context.upgrade()
    }

    /// The live context, or "engine destroyed".
    pub(crate) fn require_context(&self) -> Result<Arc<ContextInner>, Error> {
        self.context().ok_or(Error::EntityDisposed(ENGINE_DESTROYED))
    }

    pub(crate) fn isolate_id(&self) -> u64 {
        self.isolate_id
    }

    pub(crate) fn is_bound_to(&self, isolate: &IsolateInner) -> bool {
        self.isolate_id == isolate.id
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::{Arc, Weak};

    struct Target {
        me: Mutex<Weak<Target>>,
        promoted_in_drop: Arc<Mutex<Option<bool>>>,
    }

    impl Drop for Target {
        fn drop(&mut self) {
            let promoted = self.me.lock().unwrap().upgrade().is_some();
            *self.promoted_in_drop.lock().unwrap() = Some(promoted);
        }
    }

    #[test]
    fn promotion_fails_while_destructor_runs() {
        let seen = Arc::new(Mutex::new(None));
        let target = Arc::new(Target {
            me: Mutex::new(Weak::new()),
            promoted_in_drop: seen.clone(),
        });
        *target.me.lock().unwrap() = Arc::downgrade(&target);

        let weak = Arc::downgrade(&target);
        assert!(weak.upgrade().is_some());

        drop(target);

        assert_eq!(*seen.lock().unwrap(), Some(false));
        assert!(weak.upgrade().is_none());
    }
}
