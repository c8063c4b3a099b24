// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! DWARF compile-unit range extraction.
//!
//! Walks the top-level compile-unit entries of `.debug_info` and yields one
//! `[start, end)` range per covered PC interval, tagged with the unit's
//! source file. Rust units get special treatment: a Rust CU spans every
//! `.rs` file of its crate with no native per-file ranges, so the per-file
//! ranges are reconstructed by replaying the line program.

use crate::backend::{CompileUnit, KernelModule};
use crate::{objfile, paths, AnyError, VirtAddr};
use fallible_iterator::FallibleIterator;
use gimli::{constants::*, AttributeValue as AV};
use std::collections::HashMap;
use std::sync::Arc;

/// Shorthand for the [`gimli`] reader type that we use everywhere.
///
/// Until BE binaries come back into favor we simply hard-code LE at
/// compile time, getting rid of a ton of unnecessary branching.
type R<'dwarf> = gimli::EndianSlice<'dwarf, gimli::LittleEndian>;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur during range extraction.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Reader currently doesn't support big endian binaries")]
    BigEndian,

    #[error("found unexpected tag {} on top level", .0)]
    UnexpectedTopLevelTag(gimli::DwTag),

    #[error("objfile error")]
    Objfile(#[from] objfile::Error),

    #[error(transparent)]
    Other(AnyError),
}

/// Conversion of [`gimli`] errors into ours.
///
/// We erase the type here to prevent leaking [`gimli`] library types into our
/// public interface. If code needs to special-case based on particular gimli
/// errors, we should instead lift them into custom error variants.
impl From<gimli::Error> for Error {
    fn from(e: gimli::Error) -> Self {
        Self::Other(Box::new(e))
    }
}

/// PC range of a compile unit.
///
/// `[start, end)` in runtime address space; `unit` indexes the unit list
/// the range was returned alongside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcRange {
    /// First covered address.
    pub start: VirtAddr,

    /// One past the last covered address.
    pub end: VirtAddr,

    /// Index of the owning compile unit.
    pub unit: usize,
}

/// Hook that may rewrite a raw `(start, end)` range or drop it entirely
/// (e.g. strip addresses outside the text segment).
pub type PcFix<'a> = &'a (dyn Fn((VirtAddr, VirtAddr)) -> Option<(VirtAddr, VirtAddr)> + Sync);

/// Accumulates ranges and the units they refer to.
struct Collector<'a> {
    module: &'a Arc<KernelModule>,
    pc_fix: Option<PcFix<'a>>,
    unit_map: HashMap<String, usize>,
    ranges: Vec<PcRange>,
    units: Vec<CompileUnit>,
}

impl Collector<'_> {
    fn add(&mut self, range: (VirtAddr, VirtAddr), file_name: &str) {
        let range = match self.pc_fix {
            Some(fix) => match fix(range) {
                Some(range) => range,
                None => return,
            },
            None => range,
        };

        let unit = match self.unit_map.get(file_name) {
            Some(&idx) => idx,
            None => {
                let idx = self.units.len();
                self.units.push(CompileUnit {
                    name: file_name.to_owned(),
                    path: String::new(),
                    module: self.module.clone(),
                    pcs: Vec::new(),
                    cmps: Vec::new(),
                });
                self.unit_map.insert(file_name.to_owned(), idx);
                idx
            }
        };

        // Module-local addresses are file-relative; lift them into the
        // runtime address space here, at the module boundary.
        let reloc = if self.module.is_main() {
            0
        } else {
            self.module.addr
        };
        self.ranges.push(PcRange {
            start: range.0.wrapping_add(reloc),
            end: range.1.wrapping_add(reloc),
            unit,
        });
    }
}

/// Extracts the compile-unit PC ranges of a module from its DWARF data.
///
/// Returns the ranges together with the referenced units. Units are merged
/// by source file: several CUs recording the same file share one entry.
pub fn read_text_ranges(
    obj: &objfile::Reader<'_>,
    module: &Arc<KernelModule>,
    pc_fix: Option<PcFix<'_>>,
) -> Result<(Vec<PcRange>, Vec<CompileUnit>)> {
    if !obj.is_little_endian() {
        return Err(Error::BigEndian);
    }

    let sections =
        gimli::DwarfSections::load(|id| obj.load_section_reloc(id.name().as_bytes()))?;
    let dwarf = sections.borrow(|section| {
        let data = match section {
            Some(section) => &section[..],
            None => &[][..],
        };
        R::new(data, gimli::LittleEndian)
    });

    let mut out = Collector {
        module,
        pc_fix,
        unit_map: HashMap::new(),
        ranges: Vec::new(),
        units: Vec::new(),
    };

    let mut headers = dwarf.units();
    while let Some(header) = headers.next()? {
        let unit = dwarf.unit(header)?;
        process_unit(&dwarf, &unit, &mut out)?;
    }

    Ok((out.ranges, out.units))
}

/// Handles one compile unit; children of the root DIE are never visited.
fn process_unit(
    dwarf: &gimli::Dwarf<R<'_>>,
    unit: &gimli::Unit<R<'_>>,
    out: &mut Collector<'_>,
) -> Result {
    let mut entries = unit.entries();
    let Some((_, root)) = entries.next_dfs()? else {
        return Ok(());
    };
    if root.tag() != DW_TAG_compile_unit {
        return Err(Error::UnexpectedTopLevelTag(root.tag()));
    }

    let Some(name) = unit.name.map(|x| x.to_string_lossy().into_owned()) else {
        return Ok(()); // anonymous unit: nothing to attribute to
    };
    let comp_dir = unit
        .comp_dir
        .map(|x| x.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut language = None;
    let mut attrs = root.attrs();
    while let Some(attr) = attrs.next()? {
        if attr.name() == DW_AT_language {
            if let AV::Language(lang) = attr.value() {
                language = Some(lang);
            }
        }
    }

    if language == Some(DW_LANG_Rust) {
        return process_rust_unit(dwarf, unit, &comp_dir, out);
    }

    // Compile unit names are relative to the compilation dir, while the
    // per-line info isn't. The name can also already be absolute for
    // out-of-tree modules.
    let unit_name = if name.starts_with('/') {
        name
    } else {
        paths::clean(&format!("{comp_dir}/{name}"))
    };

    let ranges: Vec<gimli::Range> = dwarf.unit_ranges(unit)?.collect()?;
    for range in ranges {
        out.add((range.begin, range.end), &unit_name);
    }

    Ok(())
}

/// A line-program row, reduced to what range reconstruction needs.
///
/// `file` is [`None`] for end-of-sequence markers, which carry no file.
struct LineEntry {
    address: VirtAddr,
    file: Option<String>,
}

/// Replays a Rust unit's line program into synthetic per-file ranges.
fn process_rust_unit(
    dwarf: &gimli::Dwarf<R<'_>>,
    unit: &gimli::Unit<R<'_>>,
    comp_dir: &str,
    out: &mut Collector<'_>,
) -> Result {
    let Some(program) = unit.line_program.clone() else {
        return Ok(()); // no line table: nothing to reconstruct from
    };

    let mut file_cache: HashMap<u64, Option<String>> = HashMap::new();
    let mut entries = Vec::new();
    let mut rows = program.rows();
    while let Some((header, row)) = rows.next_row()? {
        let file = if row.end_sequence() {
            None
        } else {
            resolve_file(dwarf, unit, header, row.file_index(), comp_dir, &mut file_cache)?
        };
        entries.push(LineEntry {
            address: row.address(),
            file,
        });
    }

    rust_ranges(entries, |start, end, file| out.add((start, end), &file));
    Ok(())
}

/// Synthesises per-file ranges from a Rust unit's line entries.
///
/// Each address step closes one range per file seen since the previous
/// step. The resulting ranges overlap; attribution later picks whichever
/// range contains a PC. Files still open at the end of the program are
/// flushed as zero-width ranges so they remain attributable.
fn rust_ranges(
    entries: impl IntoIterator<Item = LineEntry>,
    mut emit: impl FnMut(VirtAddr, VirtAddr, String),
) {
    let mut start_pc: VirtAddr = 0;
    let mut files: Vec<String> = Vec::new();

    for entry in entries {
        if start_pc == 0 || entry.address != start_pc {
            for file in files.drain(..) {
                emit(start_pc, entry.address, file);
            }
            start_pc = entry.address;
        }
        // Keep on collecting file names that are covered by the range.
        if let Some(file) = entry.file {
            files.push(file);
        }
    }

    if start_pc != 0 {
        for file in files.drain(..) {
            emit(start_pc, start_pc + 1, file);
        }
    }
}

/// Resolves a line-program file index to a full path.
fn resolve_file(
    dwarf: &gimli::Dwarf<R<'_>>,
    unit: &gimli::Unit<R<'_>>,
    header: &gimli::LineProgramHeader<R<'_>>,
    index: u64,
    comp_dir: &str,
    cache: &mut HashMap<u64, Option<String>>,
) -> Result<Option<String>> {
    if let Some(cached) = cache.get(&index) {
        return Ok(cached.clone());
    }

    let resolved = resolve_file_uncached(dwarf, unit, header, index, comp_dir)?;
    cache.insert(index, resolved.clone());
    Ok(resolved)
}

fn resolve_file_uncached(
    dwarf: &gimli::Dwarf<R<'_>>,
    unit: &gimli::Unit<R<'_>>,
    header: &gimli::LineProgramHeader<R<'_>>,
    index: u64,
    comp_dir: &str,
) -> Result<Option<String>> {
    let Some(entry) = header.file(index) else {
        return Ok(None);
    };

    let name = dwarf
        .attr_string(unit, entry.path_name())?
        .to_string_lossy()
        .into_owned();
    if name.starts_with('/') {
        return Ok(Some(name));
    }

    // Directory index 0 refers to the compilation dir on pre-DWARF-5 line
    // tables; gimli reports it as an absent directory there.
    let dir = match entry.directory(header) {
        Some(av) => dwarf.attr_string(unit, av)?.to_string_lossy().into_owned(),
        None => String::new(),
    };

    let full = if dir.starts_with('/') {
        paths::clean(&format!("{dir}/{name}"))
    } else {
        paths::clean(&format!("{comp_dir}/{dir}/{name}"))
    };
    Ok(Some(full))
}
