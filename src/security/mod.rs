//! Resource governor for isolates.
//!
//! ## Components
//!
//! - [`array_buffer_allocator`]: byte budget for ArrayBuffer backing stores
//! - [`heap_limit`]: near-heap-limit backstop with one-time expansion
//! - [`heap_watch`]: sampling heap governor and stack watcher
//! - [`stack_limit`]: V8's stack guard set from `max_stack_usage`

pub(crate) mod array_buffer_allocator;
pub(crate) mod heap_limit;
pub(crate) mod heap_watch;
pub(crate) mod stack_limit;

pub use array_buffer_allocator::ArrayBufferBudget;
pub use heap_limit::HeapLimitState;
