// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Aggregation of per-module discovery results.
//!
//! Runs serially on the joined outputs of all module pipelines: symbols are
//! deduplicated and sorted, cover points get attributed to symbols and
//! symbols to compile units in single linear passes over the sorted arrays,
//! and each symbol's cover points are propagated up into its unit. Units
//! that end up without coverage are dropped; the survivors get their names
//! canonicalised.

use crate::backend::{CompileUnit, KernelDirs, Symbol};
use crate::paths;
use crate::ranges::PcRange;
use crate::scan::{CoverPoints, TRACE_PC};
use crate::VirtAddr;
use std::collections::HashSet;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur during assembly.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no coverage was attributed to any symbol or compile unit")]
    NoCoverage,
}

/// Joined per-module outputs. Range and symbol `unit` indices refer to
/// `units`.
pub struct Input {
    /// Function symbols of all modules, unsorted, possibly with duplicates.
    pub symbols: Vec<Symbol>,

    /// Compile-unit PC ranges of all modules, unsorted.
    pub ranges: Vec<PcRange>,

    /// Discovered cover points of all modules, unsorted.
    pub cover_points: CoverPoints,

    /// Compile units of all modules.
    pub units: Vec<CompileUnit>,
}

/// The attributed coverage map.
#[derive(Debug)]
pub struct Output {
    /// Symbols sorted by start, unique starts, each with ≥ 1 trace-pc point
    /// and a valid `unit` index.
    pub symbols: Vec<Symbol>,

    /// Units with ≥ 1 trace-pc point, names canonicalised.
    pub units: Vec<CompileUnit>,

    /// All trace-pc cover points, ascending.
    pub callback_points: Vec<VirtAddr>,
}

/// Cross-attributes the joined per-module results.
pub fn assemble(
    input: Input,
    dirs: &KernelDirs,
    split_build_delimiters: &[String],
) -> Result<Output> {
    let Input {
        mut symbols,
        mut ranges,
        mut cover_points,
        units,
    } = input;

    // Linkers occasionally emit several symbols at the same address; keep
    // the first occurrence.
    let mut seen = HashSet::with_capacity(symbols.len());
    symbols.retain(|s| seen.insert(s.start));
    symbols.sort_unstable_by_key(|s| s.start);

    ranges.sort_unstable_by_key(|r| r.start);
    for pcs in &mut cover_points {
        pcs.sort_unstable();
    }

    let mut symbols = build_symbols(symbols, &ranges, &cover_points);

    // Propagate cover points up into the owning units. Symbols are sorted
    // and their own lists ascending, so each unit's lists come out ascending
    // as well.
    let mut units = units;
    for sym in &symbols {
        let unit = &mut units[sym.unit];
        unit.pcs.extend_from_slice(&sym.pcs);
        unit.cmps.extend_from_slice(&sym.cmps);
    }

    // Drop units without coverage and canonicalise the survivors, compacting
    // the symbol unit indices.
    let mut remap = vec![usize::MAX; units.len()];
    let mut kept_units = Vec::new();
    for (idx, mut unit) in units.into_iter().enumerate() {
        if unit.pcs.is_empty() {
            continue;
        }
        let (name, path) = paths::clean_path(&unit.name, dirs, split_build_delimiters);
        unit.name = name;
        unit.path = path;
        remap[idx] = kept_units.len();
        kept_units.push(unit);
    }
    for sym in &mut symbols {
        // A retained symbol contributed points to its unit, so the unit
        // cannot have been dropped.
        sym.unit = remap[sym.unit];
    }

    if symbols.is_empty() || kept_units.is_empty() {
        return Err(Error::NoCoverage);
    }

    let [callback_points, _] = cover_points;
    Ok(Output {
        symbols,
        units: kept_units,
        callback_points,
    })
}

/// Attaches cover points to symbols and symbols to units.
///
/// Everything is sorted, so both attributions are single linear passes.
/// Symbols that no DWARF range covers, or that contain no trace-pc point,
/// are dropped.
fn build_symbols(
    mut symbols: Vec<Symbol>,
    ranges: &[PcRange],
    cover_points: &CoverPoints,
) -> Vec<Symbol> {
    for (pc_type, pcs) in cover_points.iter().enumerate() {
        let mut symbol_idx = 0;
        for &pc in pcs {
            while symbol_idx < symbols.len() && pc >= symbols[symbol_idx].end {
                symbol_idx += 1;
            }
            let Some(sym) = symbols.get_mut(symbol_idx) else {
                break;
            };
            // The PC can fall into the gap before the current symbol.
            if pc < sym.start {
                continue;
            }
            if pc_type == TRACE_PC {
                sym.pcs.push(pc);
            } else {
                sym.cmps.push(pc);
            }
        }
    }

    let mut range_idx = 0;
    let mut kept = Vec::with_capacity(symbols.len());
    for mut sym in symbols {
        while range_idx < ranges.len() && ranges[range_idx].end <= sym.start {
            range_idx += 1;
        }
        if range_idx == ranges.len()
            || sym.start < ranges[range_idx].start
            || sym.pcs.is_empty()
        {
            continue; // drop the symbol
        }
        sym.unit = ranges[range_idx].unit;
        kept.push(sym);
    }

    kept
}
