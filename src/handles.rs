//! Persistent handles that can be made weak with a finalizer.
//!
//! Two storage layouts share one API:
//!
//! - `fast-persistent` (default): the slot lives inline in the owner, with no
//!   extra allocation;
//! - portable: the slot is boxed, so the owner stays one word wide whatever
//!   the `v8` crate's handle layout is.

use std::mem::size_of;

enum Slot<T> {
    Empty,
    Strong(v8::Global<T>),
    Weak(v8::Weak<T>),
}

#[cfg(feature = "fast-persistent")]
type Storage<T> = Slot<T>;

#[cfg(not(feature = "fast-persistent"))]
type Storage<T> = Box<Slot<T>>;

#[cfg(feature = "fast-persistent")]
const _: () = {
    // A Global is a handle slot plus an isolate handle; the enum adds a tag.
    assert!(size_of::<v8::Global<v8::Object>>() == 2 * size_of::<usize>());
    assert!(size_of::<Persistent<v8::Object>>() <= 3 * size_of::<usize>());
};

#[cfg(not(feature = "fast-persistent"))]
const _: () = assert!(size_of::<Persistent<v8::Object>>() == size_of::<usize>());

pub struct Persistent<T> {
    slot: Storage<T>,
}

#[cfg(feature = "fast-persistent")]
fn store<T>(slot: Slot<T>) -> Storage<T> {
    slot
}

#[cfg(not(feature = "fast-persistent"))]
fn store<T>(slot: Slot<T>) -> Storage<T> {
    Box::new(slot)
}

impl<T> Persistent<T> {
    fn slot(&self) -> &Slot<T> {
        &self.slot
    }

    fn slot_mut(&mut self) -> &mut Slot<T> {
        &mut self.slot
    }

    pub fn empty() -> Self {
        Self {
            slot: store(Slot::Empty),
        }
    }

    pub fn new(isolate: &mut v8::Isolate, local: v8::Local<'_, T>) -> Self {
        Self::from_global(v8::Global::new(isolate, local))
    }

    pub fn from_global(global: v8::Global<T>) -> Self {
        Self {
            slot: store(Slot::Strong(global)),
        }
    }

    /// `true` once disposed, or after a weak target was collected.
    pub fn is_empty(&self) -> bool {
        match self.slot() {
            Slot::Empty => true,
            Slot::Strong(_) => false,
            Slot::Weak(weak) => weak.is_empty(),
        }
    }

    pub fn is_weak(&self) -> bool {
        matches!(self.slot(), Slot::Weak(_))
    }

    pub fn get<'s>(&self, scope: &mut v8::PinScope<'s, '_>) -> Option<v8::Local<'s, T>> {
        match self.slot() {
            Slot::Empty => None,
            Slot::Strong(global) => Some(v8::Local::new(scope, global)),
            Slot::Weak(weak) => weak.to_local(scope),
        }
    }

    /// A strong copy of the handle, if the target is still alive.
    pub fn to_global(&self, isolate: &mut v8::Isolate) -> Option<v8::Global<T>> {
        match self.slot() {
            Slot::Empty => None,
            Slot::Strong(global) => Some(global.clone()),
            Slot::Weak(weak) => weak.to_global(isolate),
        }
    }

    /// Let V8 collect the target; `finalizer` runs after collection.
    ///
    /// No-op on an empty handle.
    pub fn set_weak(&mut self, isolate: &mut v8::Isolate, finalizer: impl FnOnce(&mut v8::Isolate) + 'static) {
        let current = std::mem::replace(self.slot_mut(), Slot::Empty);
        *self.slot_mut() = match current {
            Slot::Strong(global) => Slot::Weak(v8::Weak::with_finalizer(isolate, &global, Box::new(finalizer))),
            Slot::Weak(weak) => match weak.to_global(isolate) {
                Some(global) => Slot::Weak(v8::Weak::with_finalizer(isolate, &global, Box::new(finalizer))),
                None => Slot::Empty,
            },
            Slot::Empty => Slot::Empty,
        };
    }

    /// Make the handle strong again. The pending finalizer is dropped unrun.
    pub fn clear_weak(&mut self, isolate: &mut v8::Isolate) {
        if let Slot::Weak(weak) = self.slot() {
            let strong = weak.to_global(isolate);
            *self.slot_mut() = match strong {
                Some(global) => Slot::Strong(global),
                None => Slot::Empty,
            };
        }
    }

    /// Release the handle. Must run with the isolate locked.
    pub fn dispose(&mut self) {
        *self.slot_mut() = Slot::Empty;
    }
}

impl<T> Default for Persistent<T> {
    fn default() -> Self {
        Self::empty()
    }
}
