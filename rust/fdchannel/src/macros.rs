// Logging macros for fdchannel.
//
// Thin forwarders to the tracing crate so every call site logs under the
// `fdchannel` target without repeating it.

#![allow(unused_macro_rules)]

// trace! - every descriptor passed or received
macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "fdchannel", $($arg)*) }
}

// debug! - surplus descriptors dropped, empty control sections
macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "fdchannel", $($arg)*) }
}

// warn! - protocol violations reported to the caller
macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "fdchannel", $($arg)*) }
}

// Macros are made available via #[macro_use] on the module in lib.rs
