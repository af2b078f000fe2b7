//! Global V8 platform initialization.
//!
//! V8 can only be initialized once per process. The first isolate created
//! decides the global flags; later requests with different flags are logged
//! and ignored.

use std::sync::OnceLock;

use crate::config::GlobalFlags;

struct Platform {
    platform: v8::SharedRef<v8::Platform>,
    flags: GlobalFlags,
}

static PLATFORM: OnceLock<Platform> = OnceLock::new();

/// Get the global V8 platform, initializing it with `flags` if necessary.
///
/// Safe to call from multiple threads.
pub fn initialize(flags: GlobalFlags) -> &'static v8::SharedRef<v8::Platform> {
    let platform = PLATFORM.get_or_init(|| {
        if flags.contains(GlobalFlags::DISABLE_JIT_COMPILATION) {
            v8::V8::set_flags_from_string("--jitless");
            log::info!("V8 JIT compilation disabled");
        }

        if !flags.contains(GlobalFlags::ENABLE_TOP_LEVEL_AWAIT) {
            log::debug!("top-level await is part of the language in this V8 build; flag ignored");
        }

        // On macOS, use single-threaded GC to avoid code collection issues
        #[cfg(target_os = "macos")]
        v8::V8::set_flags_from_string("--single-threaded-gc");

        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();

        log::info!("V8 {} initialized (flags: {:?})", v8::V8::get_version(), flags);

        Platform { platform, flags }
    });

    if platform.flags != flags {
        log::warn!(
            "V8 already initialized with {:?}; requested {:?} ignored",
            platform.flags,
            flags
        );
    }

    &platform.platform
}

/// The platform if it has been initialized.
pub fn get_platform() -> Option<&'static v8::SharedRef<v8::Platform>> {
    PLATFORM.get().map(|p| &p.platform)
}

/// Run pending foreground platform tasks for `isolate` without blocking.
pub(crate) fn pump_message_loop(isolate: &mut v8::Isolate) {
    if let Some(platform) = get_platform() {
        while v8::Platform::pump_message_loop(platform, isolate, false) {}
    }
}
