//! Debug tracing gated by the `FRONTEND_DEBUG` environment variable.

use std::sync::OnceLock;

/// Cached result of the environment lookup, resolved once per process.
static ENABLED: OnceLock<bool> = OnceLock::new();

/// Whether verbose tracing is enabled for this process.
#[must_use]
pub fn enabled() -> bool {
    *ENABLED.get_or_init(|| std::env::var_os("FRONTEND_DEBUG").is_some())
}

/// Prints a trace line on standard output when `FRONTEND_DEBUG` is set.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        if $crate::trace::enabled() {
            #[allow(clippy::print_stdout)]
            {
                ::std::println!("[tether] {}", ::std::format_args!($($arg)*));
            }
        }
    };
}
