// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod arch;
pub mod assemble;
pub mod backend;
pub mod dbglog;
pub mod elf;
pub mod objdump;
pub mod objfile;
pub mod paths;
pub mod ranges;
pub mod scan;
pub mod symbols;
pub mod symbolize;

/// Type-erased error type.
///
/// We primarily use this to hand out errors from third-party libraries where
/// lifting them into distinct error variants didn't make sense because no
/// consumer cares about differentiating between different error variants.
pub type AnyError = Box<dyn std::error::Error + Send + Sync>;

/// Virtual address in the ELF address space (or, for loadable modules that
/// have been relocated, in the runtime kernel address space).
pub type VirtAddr = u64;
