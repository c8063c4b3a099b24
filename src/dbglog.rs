// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Opt-in diagnostics for coverage discovery.
//!
//! Discovery walks every compile unit and every text byte of a kernel
//! build, so the interesting events are rare one-liners: how many units and
//! symbols were found, which units were skipped and why. Pulling in the
//! `log` crate plus a subscriber for that buys nothing; a single switch
//! routing [`debug`] to stderr is enough. Revisit if the crate ever grows
//! consumers that want structured output.

use std::sync::atomic::{AtomicBool, Ordering};

// Re-export so the macro shows up next to its switch in rustdoc.
pub use crate::debug;

/// Master switch for [`debug`] output.
pub static ENABLED: AtomicBool = AtomicBool::new(false);

/// Turns [`debug`] output on or off at runtime.
///
/// Callers typically wire this to a `-debug`-style flag before starting
/// discovery.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

/// Print to stderr if diagnostics were switched on via
/// [`set_enabled`](crate::dbglog::set_enabled).
///
/// See [`eprintln`] documentation for usage.
#[macro_export]
macro_rules! debug {
    ( $($args:tt)* ) => {
        if $crate::dbglog::ENABLED.load(::std::sync::atomic::Ordering::Relaxed) {
            ::std::eprintln!( $($args)* );
        }
    }
}
