//! Logging shims.
//!
//! Forward to the `log` crate when the `log` feature is enabled and expand to
//! nothing otherwise, so the driver stays usable without a logger.

#[cfg(feature = "log")]
macro_rules! trace {
    ($($arg:tt)+) => { ::log::trace!($($arg)+) };
}

#[cfg(feature = "log")]
macro_rules! debug {
    ($($arg:tt)+) => { ::log::debug!($($arg)+) };
}

#[cfg(feature = "log")]
macro_rules! info {
    ($($arg:tt)+) => { ::log::info!($($arg)+) };
}

#[cfg(feature = "log")]
macro_rules! warn {
    ($($arg:tt)+) => { ::log::warn!($($arg)+) };
}

// The arguments still go through `format_args!` so that they count as used.

#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($arg:tt)+) => {{
        let _ = core::format_args!($($arg)+);
    }};
}

#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)+) => {{
        let _ = core::format_args!($($arg)+);
    }};
}

#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)+) => {{
        let _ = core::format_args!($($arg)+);
    }};
}

#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)+) => {{
        let _ = core::format_args!($($arg)+);
    }};
}
