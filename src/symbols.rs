// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! ELF symbol-table reading.
//!
//! Two things come out of the symbol table of a kernel binary: the list of
//! function symbols that cover points later get attributed to, and the set
//! of addresses (plus symbol-table indices) of the KCOV callbacks
//! themselves — `__sanitizer_cov_trace_pc` and friends, including the
//! veneers and trampolines linkers interpose for long-range calls and the
//! PLT stubs that calls across object boundaries are routed through.

use crate::arch::KernelArch;
use crate::backend::{KernelModule, Symbol};
use crate::{objfile, VirtAddr};
use object::{Object as _, ObjectSection as _, ObjectSymbol as _};
use std::collections::HashSet;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur during symbol reading.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object file has no text section")]
    NoTextSection,

    #[error("objfile error")]
    Objfile(#[from] objfile::Error),
}

/// Per-module record of which symbol addresses are coverage callbacks.
///
/// Addresses are kept in the file's own address space (not relocated by the
/// module load address): the scanner compares them against branch targets
/// computed from the file's text bytes. The index sets serve the same
/// purpose for unlinked modules, where callback calls are only visible as
/// relocations referencing the callback's symbol-table slot.
#[derive(Debug, Default)]
pub struct SymbolInfo {
    /// Virtual address of the text section.
    pub text_addr: VirtAddr,

    /// Addresses of `__sanitizer_cov_trace_pc` and its trampolines/veneers.
    pub trace_pc: HashSet<VirtAddr>,

    /// Addresses of the comparison callbacks (`trace_cmp*`, `const_cmp*`,
    /// `switch`).
    pub trace_cmp: HashSet<VirtAddr>,

    /// Symbol-table indices corresponding to [`Self::trace_pc`].
    pub trace_pc_idx: HashSet<usize>,

    /// Symbol-table indices corresponding to [`Self::trace_cmp`].
    pub trace_cmp_idx: HashSet<usize>,
}

/// Kind of coverage callback a symbol name denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// `__sanitizer_cov_trace_pc` / `__sanitizer_cov_trace_pc_guard`.
    TracePc,

    /// `__sanitizer_cov_trace_{cmp*,const_cmp*,switch}`.
    TraceCmp,
}

/// Classifies a symbol name as a coverage callback, if it is one.
///
/// Veneer aliases (`____sanitizer_cov_trace_pc_veneer`) count as the
/// callback they forward to. `__sanitizer_cov_trace_pc_guard_init` is not a
/// per-block callback and is deliberately left unclassified.
pub fn callback_kind(name: &str) -> Option<CallbackKind> {
    let stripped = name.trim_start_matches('_');
    let rest = stripped.strip_prefix("sanitizer_cov_trace_")?;
    let rest = rest.strip_suffix("_veneer").unwrap_or(rest);

    if rest == "pc" || rest == "pc_guard" {
        return Some(CallbackKind::TracePc);
    }

    if rest.starts_with("cmp") || rest.starts_with("const_cmp") || rest == "switch" {
        return Some(CallbackKind::TraceCmp);
    }

    None
}

/// Reads the function symbols of a module and fills in `info`.
///
/// Function symbols of loadable modules are relocated into the runtime
/// address space; the callback sets in `info` stay file-relative (see
/// [`SymbolInfo`]).
pub fn read_symbols(
    obj: &objfile::Reader<'_>,
    module: &KernelModule,
    arch: KernelArch,
    info: &mut SymbolInfo,
) -> Result<Vec<Symbol>> {
    let raw = obj.raw();

    let text = raw
        .section_by_name(".text")
        .ok_or(Error::NoTextSection)?;
    info.text_addr = text.address();

    let reloc = if module.is_main() { 0 } else { module.addr };

    let mut symbols = Vec::new();
    for sym in raw.symbols() {
        let Ok(name) = sym.name() else {
            continue; // skip non-utf8 symbols
        };

        match callback_kind(name) {
            Some(CallbackKind::TracePc) => {
                info.trace_pc.insert(sym.address());
                info.trace_pc_idx.insert(sym.index().0);
            }
            Some(CallbackKind::TraceCmp) => {
                info.trace_cmp.insert(sym.address());
                info.trace_cmp_idx.insert(sym.index().0);
            }
            None => {}
        }

        if sym.kind() != object::SymbolKind::Text || sym.size() == 0 {
            continue;
        }

        let start = sym.address().wrapping_add(reloc);
        symbols.push(Symbol {
            start,
            end: start + sym.size(),
            name: name.to_owned(),
            unit: 0,
            pcs: Vec::new(),
            cmps: Vec::new(),
        });
    }

    // Modules resolve their callback calls through relocation indices
    // instead; only the main image's bytes are scanned against the sets.
    if module.is_main() {
        collect_plt_callbacks(obj, arch, info);
    }

    Ok(symbols)
}

/// Adds the PLT stub addresses of callback calls routed through a PLT.
///
/// When the image links its callback calls across a shared-object boundary,
/// the branch target baked into the call instruction is a PLT entry, not
/// the callback symbol — a set holding only symbol addresses would miss
/// every such call site. Each of those calls still carries a call
/// relocation against the callback's symbol-table slot, so decoding the
/// linked instruction at the relocation site recovers the stub address.
fn collect_plt_callbacks(obj: &objfile::Reader<'_>, arch: KernelArch, info: &mut SymbolInfo) {
    let Some(dec) = arch.call_decoder() else {
        return; // slow-path arches match callbacks by name in objdump output
    };

    // Relocatable files record relocation offsets relative to the section;
    // linked images record the virtual address.
    let relocatable = obj.raw().kind() == object::ObjectKind::Relocatable;

    for section in obj.raw().sections() {
        if section.kind() != object::SectionKind::Text {
            continue;
        }
        if section.relocations().next().is_none() {
            continue;
        }
        let Ok(data) = section.data() else {
            continue;
        };
        let sec_addr = section.address();

        for (offset, reloc) in section.relocations() {
            let object::RelocationFlags::Elf { r_type } = reloc.flags() else {
                continue;
            };
            if r_type != dec.call_reloc_type {
                continue;
            }
            let object::RelocationTarget::Symbol(sym_idx) = reloc.target() else {
                continue;
            };
            let is_pc = info.trace_pc_idx.contains(&sym_idx.0);
            let is_cmp = info.trace_cmp_idx.contains(&sym_idx.0);
            if !is_pc && !is_cmp {
                continue;
            }

            // The relocation is applied `rela_offset` bytes into the call
            // instruction; the linked bytes hold the resolved stub target.
            let reloc_va = if relocatable {
                sec_addr.wrapping_add(offset)
            } else {
                offset
            };
            let call_va = reloc_va.wrapping_sub(dec.rela_offset);

            let insn = usize::try_from(call_va.wrapping_sub(sec_addr))
                .ok()
                .and_then(|start| Some(start..start.checked_add(dec.call_len)?))
                .and_then(|range| data.get(range));
            let Some(insn) = insn else {
                continue;
            };
            if !dec.is_call_insn(insn) {
                continue;
            }

            let target = dec.call_target(insn, call_va);
            if is_pc {
                info.trace_pc.insert(target);
            } else {
                info.trace_cmp.insert(target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{build_text_elf, loadable_module, main_image};

    #[test]
    fn classify() {
        use CallbackKind::*;
        assert_eq!(callback_kind("__sanitizer_cov_trace_pc"), Some(TracePc));
        assert_eq!(
            callback_kind("__sanitizer_cov_trace_pc_guard"),
            Some(TracePc)
        );
        assert_eq!(
            callback_kind("____sanitizer_cov_trace_pc_veneer"),
            Some(TracePc)
        );
        assert_eq!(callback_kind("__sanitizer_cov_trace_cmp4"), Some(TraceCmp));
        assert_eq!(
            callback_kind("__sanitizer_cov_trace_const_cmp8"),
            Some(TraceCmp)
        );
        assert_eq!(callback_kind("__sanitizer_cov_trace_switch"), Some(TraceCmp));

        assert_eq!(callback_kind("__sanitizer_cov_trace_pc_guard_init"), None);
        assert_eq!(callback_kind("memcpy"), None);
        assert_eq!(callback_kind("do_sanitize"), None);
    }

    #[test]
    fn read_main_image() {
        let fixture = build_text_elf(
            &[0x90; 0x60],
            &[
                ("funcA", 0x10, 0x20),
                ("funcB", 0x30, 0x10),
                ("__sanitizer_cov_trace_pc", 0x40, 0x8),
                ("__sanitizer_cov_trace_cmp4", 0x50, 0x8),
            ],
        );

        let obj = objfile::File::load(fixture.path()).unwrap();
        let obj = obj.parse().unwrap();

        let mut info = SymbolInfo::default();
        let symbols = read_symbols(&obj, &main_image(), KernelArch::Amd64, &mut info).unwrap();

        assert!(info.trace_pc.contains(&0x40));
        assert!(info.trace_cmp.contains(&0x50));
        assert_eq!(info.trace_pc.len(), 1);
        assert_eq!(info.trace_cmp.len(), 1);
        assert_eq!(info.trace_pc_idx.len(), 1);
        assert_eq!(info.trace_cmp_idx.len(), 1);

        // Callback symbols are functions too and stay in the symbol list;
        // assembly later drops whatever has no coverage attributed.
        let func_a = symbols.iter().find(|s| s.name == "funcA").unwrap();
        assert_eq!((func_a.start, func_a.end), (0x10, 0x30));
        let func_b = symbols.iter().find(|s| s.name == "funcB").unwrap();
        assert_eq!((func_b.start, func_b.end), (0x30, 0x40));
    }

    #[test]
    fn module_symbols_are_relocated() {
        let fixture = build_text_elf(&[0x90; 0x40], &[("mod_func", 0x10, 0x10)]);

        let obj = objfile::File::load(fixture.path()).unwrap();
        let obj = obj.parse().unwrap();

        let module = loadable_module("dummy", 0xffff_8000_0000_0000);
        let mut info = SymbolInfo::default();
        let symbols = read_symbols(&obj, &module, KernelArch::Amd64, &mut info).unwrap();

        let func = symbols.iter().find(|s| s.name == "mod_func").unwrap();
        assert_eq!(func.start, 0xffff_8000_0000_0010);
        assert_eq!(func.end, 0xffff_8000_0000_0020);
    }

    #[test]
    fn plt_routed_callbacks() {
        use object::write::{Object as WriteObject, Relocation, Symbol as WriteSymbol};
        use std::io::Write as _;

        // A call whose linked branch target is a PLT stub at 0x4000 rather
        // than the callback itself; the call relocation still names the
        // callback's symbol-table slot.
        let mut obj = WriteObject::new(
            object::BinaryFormat::Elf,
            object::Architecture::X86_64,
            object::Endianness::Little,
        );
        let text_id = obj.add_section(Vec::new(), b".text".to_vec(), object::SectionKind::Text);
        let mut text = vec![0x90u8; 0x20];
        text[0x08..0x0d].copy_from_slice(&crate::tests::call_e8(0x08, 0x4000));
        text[0x14..0x19].copy_from_slice(&crate::tests::call_e8(0x14, 0x4010));
        obj.append_section_data(text_id, &text, 16);

        let mut callback = |name: &[u8]| {
            obj.add_symbol(WriteSymbol {
                name: name.to_vec(),
                value: 0,
                size: 0,
                kind: object::SymbolKind::Text,
                scope: object::SymbolScope::Unknown,
                weak: false,
                section: object::write::SymbolSection::Undefined,
                flags: object::SymbolFlags::None,
            })
        };
        let trace_pc = callback(b"__sanitizer_cov_trace_pc");
        let trace_cmp = callback(b"__sanitizer_cov_trace_cmp4");

        for (offset, symbol) in [(0x09, trace_pc), (0x15, trace_cmp)] {
            obj.add_relocation(
                text_id,
                Relocation {
                    offset,
                    symbol,
                    addend: -4,
                    flags: object::RelocationFlags::Elf {
                        r_type: object::elf::R_X86_64_PLT32,
                    },
                },
            )
            .unwrap();
        }

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&obj.write().unwrap()).unwrap();

        let obj = objfile::File::load(file.path()).unwrap();
        let obj = obj.parse().unwrap();

        let mut info = SymbolInfo::default();
        read_symbols(&obj, &main_image(), KernelArch::Amd64, &mut info).unwrap();

        // Stub addresses decoded from the relocated call sites.
        assert!(info.trace_pc.contains(&0x4000), "{:?}", info.trace_pc);
        assert!(info.trace_cmp.contains(&0x4010), "{:?}", info.trace_cmp);

        // A loadable module must not pick up stub addresses: its callback
        // calls are counted through the relocation indices instead.
        let mut info = SymbolInfo::default();
        read_symbols(
            &obj,
            &loadable_module("dummy", 0x1000),
            KernelArch::Amd64,
            &mut info,
        )
        .unwrap();
        assert!(info.trace_pc.len() == 1 && !info.trace_pc.contains(&0x4000));
    }
}
