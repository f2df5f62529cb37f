// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Log sink wiring for the `log` facade.
//!
//! The crate logs through the standard [`log`] macros; this module supplies
//! the device-side sink. Hosts either install [`ConsoleOutput`] (stderr, for
//! development) or [`CallbackOutput`] (forwards every record to a host
//! function, the embedded-friendly path). Both go through [`init_logger`],
//! which bridges to `log::set_boxed_logger`.
//!
//! Initialization is one-shot: later calls are ignored, matching the
//! `log` facade contract.

mod logger;
mod output;

pub use logger::{flush_logger, init_logger};
pub use output::{CallbackOutput, ConsoleOutput, LogLevel, Output};
