//! Error types for frontend operations.

/// Alias for `Result<T, tether::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by channel setup and teardown.
///
/// Wire-level failures inside a running session are not surfaced here:
/// they drive the channel status machine instead (a read or write error
/// turns the channel dead rather than unwinding the loop).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A serial port operation failed.
    #[error("{op}: {source}")]
    Serial {
        /// The port operation that failed.
        op: &'static str,
        /// The underlying OS error.
        source: nix::Error,
    },

    /// An I/O error during channel setup.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
