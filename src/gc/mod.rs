//! Handle lifetime management across threads.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Holder dropped on a foreign thread                         │
//! │  └── v8::Global moved into DeferredDestructionQueue         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  IsolateInner::with_lock (outermost entry)                  │
//! │  ├── v8::Locker                                             │
//! │  └── DeferredDestructionQueue::process_all()                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod deferred_destruction;

pub use deferred_destruction::{DeferredDestructionQueue, DeferredHandle};
