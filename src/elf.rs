// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The ELF/DWARF implementation of the pluggable reader set.
//!
//! This is the reader set used for Linux-style kernels: symbols and text
//! bytes come straight from the ELF, compile-unit ranges from DWARF, and
//! loadable-module cover points from relocations — an unlinked `.ko` never
//! has resolved branch targets for its callback calls, but every such call
//! carries a call relocation against the callback's symbol-table slot.

use crate::arch::KernelArch;
use crate::backend::{CompileUnit, Error, KernelModule, ObjectReaders, Result, Symbol, Target};
use crate::objfile;
use crate::ranges::{self, PcRange};
use crate::scan::{CoverPoints, TRACE_CMP, TRACE_PC};
use crate::symbols::{self, SymbolInfo};
use object::{Object as _, ObjectSection as _};
use std::sync::Arc;

/// Reader set for ELF kernels with DWARF debug info.
#[derive(Debug, Clone, Copy)]
pub struct ElfReaders {
    arch: KernelArch,
}

impl ElfReaders {
    /// Creates the reader set for the given kernel architecture.
    pub fn new(arch: KernelArch) -> Self {
        Self { arch }
    }
}

impl ObjectReaders for ElfReaders {
    fn read_symbols(&self, module: &KernelModule, info: &mut SymbolInfo) -> Result<Vec<Symbol>> {
        let file = objfile::File::load(&module.path)?;
        let obj = file.parse()?;
        Ok(symbols::read_symbols(&obj, module, self.arch, info)?)
    }

    fn read_text_data(&self, module: &KernelModule) -> Result<Vec<u8>> {
        let file = objfile::File::load(&module.path)?;
        let obj = file.parse()?;
        let section = obj
            .load_section(b".text")?
            .ok_or_else(|| Error::Format("no .text section".into()))?;
        Ok(section.to_vec())
    }

    fn read_module_cover_points(
        &self,
        target: &Target,
        module: &KernelModule,
        info: &SymbolInfo,
    ) -> Result<CoverPoints> {
        let dec = target
            .arch
            .call_decoder()
            .ok_or_else(|| Error::Format("no call relocation type for this arch".into()))?;

        let file = objfile::File::load(&module.path)?;
        let obj = file.parse()?;

        let mut pcs: CoverPoints = Default::default();
        for section in obj.raw().sections() {
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

                // The relocation is applied `rela_offset` bytes into the
                // call instruction.
                let pc = module
                    .addr
                    .wrapping_add(section.address())
                    .wrapping_add(offset)
                    .wrapping_sub(dec.rela_offset);

                if info.trace_pc_idx.contains(&sym_idx.0) {
                    pcs[TRACE_PC].push(pc);
                } else if info.trace_cmp_idx.contains(&sym_idx.0) {
                    pcs[TRACE_CMP].push(pc);
                }
            }
        }

        Ok(pcs)
    }

    fn read_text_ranges(
        &self,
        module: &Arc<KernelModule>,
    ) -> Result<(Vec<PcRange>, Vec<CompileUnit>)> {
        let file = objfile::File::load(&module.path)?;
        let obj = file.parse()?;
        Ok(ranges::read_text_ranges(&obj, module, None)?)
    }

    fn get_compiler_version(&self, module: &KernelModule) -> String {
        // Kernels record every producer that contributed to the link in the
        // NUL-separated `.comment` section; the first entry is the compiler.
        let Ok(file) = objfile::File::load(&module.path) else {
            return String::new();
        };
        let Ok(obj) = file.parse() else {
            return String::new();
        };
        let Ok(Some(section)) = obj.load_section(b".comment") else {
            return String::new();
        };

        String::from_utf8_lossy(&section)
            .split('\0')
            .find(|entry| !entry.is_empty())
            .unwrap_or_default()
            .to_owned()
    }
}
