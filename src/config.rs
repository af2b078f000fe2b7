//! Isolate and context configuration.
//!
//! Both option sets deserialize from any serde format, so a host can keep them
//! in its own config file. Zero means "no limit" for every size field.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

bitflags::bitflags! {
    /// Process-wide V8 flags, applied once before the platform starts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GlobalFlags: u32 {
        const ENABLE_TOP_LEVEL_AWAIT = 1 << 0;
        const DISABLE_JIT_COMPILATION = 1 << 1;
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IsolateOptions {
    pub name: String,

    /// Initial V8 heap reservation in bytes.
    pub initial_heap_size: usize,

    /// Heap governor threshold in bytes. `0` disables the governor.
    pub max_heap_size: usize,

    /// How often the governor samples heap usage.
    #[serde(with = "duration_ms")]
    pub heap_size_sample_interval: Duration,

    /// Factor applied once to the V8 heap limit when it is first reached.
    pub heap_expansion_multiplier: f64,

    /// Native stack budget for script execution in bytes. `0` disables the watcher.
    pub max_stack_usage: usize,

    /// Budget for ArrayBuffer backing stores in bytes. `0` means unbounded.
    pub max_array_buffer_allocation: usize,

    /// Sampling interval for CPU profiles, in microseconds.
    pub cpu_profile_sample_interval: u32,

    /// Report interrupts as `ScriptInterrupted` instead of a generic failure.
    pub enable_interrupt_propagation: bool,

    /// Sample the heap but never terminate on violation.
    pub disable_heap_size_violation_interrupt: bool,

    /// Port handed to the debug agent when a context enables debugging.
    pub debug_port: u16,
}

impl Default for IsolateOptions {
    fn default() -> Self {
        Self {
            name: "isolate".to_string(),
            initial_heap_size: 0,
            max_heap_size: 0,
            heap_size_sample_interval: Duration::from_millis(50),
            heap_expansion_multiplier: 1.25,
            max_stack_usage: 0,
            max_array_buffer_allocation: 0,
            cpu_profile_sample_interval: 1000,
            enable_interrupt_propagation: false,
            disable_heap_size_violation_interrupt: false,
            debug_port: 9222,
        }
    }
}

impl IsolateOptions {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = bytes;
        self
    }

    pub fn heap_size_sample_interval(mut self, interval: Duration) -> Self {
        self.heap_size_sample_interval = interval;
        self
    }

    pub fn max_stack_usage(mut self, bytes: usize) -> Self {
        self.max_stack_usage = bytes;
        self
    }

    pub fn max_array_buffer_allocation(mut self, bytes: usize) -> Self {
        self.max_array_buffer_allocation = bytes;
        self
    }

    pub fn enable_interrupt_propagation(mut self, enable: bool) -> Self {
        self.enable_interrupt_propagation = enable;
        self
    }

    pub fn debug_port(mut self, port: u16) -> Self {
        self.debug_port = port;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(self.heap_expansion_multiplier >= 1.0) {
            return Err(Error::Config(format!(
                "heap_expansion_multiplier must be >= 1.0, got {}",
                self.heap_expansion_multiplier
            )));
        }
        if self.max_heap_size > 0 && self.heap_size_sample_interval.is_zero() {
            return Err(Error::Config(
                "heap_size_sample_interval must be non-zero when max_heap_size is set".into(),
            ));
        }
        if self.initial_heap_size > 0 && self.max_heap_size > 0 && self.initial_heap_size > self.max_heap_size {
            return Err(Error::Config("initial_heap_size exceeds max_heap_size".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    pub name: String,
    pub enable_debugging: bool,
    pub enable_remote_debugging: bool,
    pub enable_date_time_conversion: bool,
    pub enable_dynamic_module_imports: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            name: "context".to_string(),
            enable_debugging: false,
            enable_remote_debugging: false,
            enable_date_time_conversion: false,
            enable_dynamic_module_imports: true,
        }
    }
}

impl ContextOptions {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn enable_debugging(mut self, enable: bool) -> Self {
        self.enable_debugging = enable;
        self
    }

    pub fn enable_remote_debugging(mut self, enable: bool) -> Self {
        self.enable_remote_debugging = enable;
        self
    }

    pub fn enable_date_time_conversion(mut self, enable: bool) -> Self {
        self.enable_date_time_conversion = enable;
        self
    }

    pub fn enable_dynamic_module_imports(mut self, enable: bool) -> Self {
        self.enable_dynamic_module_imports = enable;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
