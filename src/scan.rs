// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Fast cover-point scanner.
//!
//! Walks the raw text bytes of a binary, decoding candidate call
//! instructions in-process and testing their branch targets against the
//! callback-address sets from [`crate::symbols`]. On variable-length ISAs
//! every byte offset is probed; false positives are filtered by the
//! membership test, whose false-positive probability is roughly
//! `|callbacks| / 2^32` per candidate and negligible in practice.

use crate::arch::{CallDecoder, KernelArch};
use crate::symbols::SymbolInfo;
use crate::VirtAddr;

/// Index of the trace-pc list in [`CoverPoints`].
pub const TRACE_PC: usize = 0;

/// Index of the trace-cmp list in [`CoverPoints`].
pub const TRACE_CMP: usize = 1;

/// Discovered cover points: trace-pc call sites at [`TRACE_PC`], comparison
/// callback call sites at [`TRACE_CMP`].
pub type CoverPoints = [Vec<VirtAddr>; 2];

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur during cover-point scanning.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no __sanitizer_cov_trace_pc symbol in the object file")]
    NoTracePc,

    #[error("no fast call decoder for {}", .0.name())]
    NoFastDecoder(KernelArch),
}

/// Finds the next direct-call instruction at or after `*pos` and returns its
/// `(target, pc)` pair, advancing `*pos` past the match.
fn next_call_target(
    dec: &CallDecoder,
    text_addr: VirtAddr,
    data: &[u8],
    pos: &mut usize,
) -> Option<(VirtAddr, VirtAddr)> {
    while *pos + dec.call_len <= data.len() {
        let i = *pos;
        *pos += dec.scan_size;

        let insn = &data[i..i + dec.call_len];
        if !dec.is_call_insn(insn) {
            continue;
        }

        let pc = text_addr + i as VirtAddr;
        return Some((dec.call_target(insn, pc), pc));
    }

    None
}

/// Finds all cover points (calls of `__sanitizer_cov_trace_*`) in the text
/// bytes of a binary.
///
/// Both returned lists are ascending by construction since the scan
/// position only ever moves forward.
pub fn read_cover_points(
    arch: KernelArch,
    info: &SymbolInfo,
    data: &[u8],
) -> Result<CoverPoints> {
    if info.trace_pc.is_empty() {
        return Err(Error::NoTracePc);
    }

    let dec = arch.call_decoder().ok_or(Error::NoFastDecoder(arch))?;

    let mut pcs: CoverPoints = Default::default();
    let mut pos = 0;
    while let Some((target, pc)) = next_call_target(&dec, info.text_addr, data, &mut pos) {
        if info.trace_pc.contains(&target) {
            pcs[TRACE_PC].push(pc);
        } else if info.trace_cmp.contains(&target) {
            pcs[TRACE_CMP].push(pc);
        }
    }

    Ok(pcs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::call_e8;

    fn info_with(text_addr: VirtAddr, pc: &[VirtAddr], cmp: &[VirtAddr]) -> SymbolInfo {
        SymbolInfo {
            text_addr,
            trace_pc: pc.iter().copied().collect(),
            trace_cmp: cmp.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn classifies_by_target() {
        let text_addr = 0x1000;
        let mut text = vec![0x90u8; 0x40];

        // Call to the trace-pc callback at offset 0x08.
        text[0x08..0x0d].copy_from_slice(&call_e8(text_addr + 0x08, 0x2000));
        // Call to the cmp callback at offset 0x20.
        text[0x20..0x25].copy_from_slice(&call_e8(text_addr + 0x20, 0x3000));
        // Unrelated call at offset 0x30: ignored.
        text[0x30..0x35].copy_from_slice(&call_e8(text_addr + 0x30, 0x4000));

        let info = info_with(text_addr, &[0x2000], &[0x3000]);
        let pcs = read_cover_points(KernelArch::Amd64, &info, &text).unwrap();

        assert_eq!(pcs[TRACE_PC], vec![text_addr + 0x08]);
        assert_eq!(pcs[TRACE_CMP], vec![text_addr + 0x20]);
    }

    #[test]
    fn zero_displacement_call() {
        // `E8 00 00 00 00` at offset k covers iff its fallthrough address is
        // a registered callback.
        let text_addr = 0x100;
        let k = 0x10;
        let mut text = vec![0x90u8; 0x20];
        text[k..k + 5].copy_from_slice(&[0xe8, 0, 0, 0, 0]);

        let fallthrough = text_addr + k as VirtAddr + 5;
        let hit = info_with(text_addr, &[fallthrough], &[]);
        let pcs = read_cover_points(KernelArch::Amd64, &hit, &text).unwrap();
        assert_eq!(pcs[TRACE_PC], vec![text_addr + k as VirtAddr]);

        let miss = info_with(text_addr, &[fallthrough + 1], &[]);
        let pcs = read_cover_points(KernelArch::Amd64, &miss, &text).unwrap();
        assert!(pcs[TRACE_PC].is_empty());
    }

    #[test]
    fn outputs_are_ascending() {
        let text_addr = 0;
        let mut text = vec![0x90u8; 0x100];
        for k in [0x80usize, 0x40, 0x10, 0xc0] {
            text[k..k + 5].copy_from_slice(&call_e8(k as VirtAddr, 0x8000));
        }

        let info = info_with(text_addr, &[0x8000], &[]);
        let pcs = read_cover_points(KernelArch::Amd64, &info, &text).unwrap();
        assert_eq!(pcs[TRACE_PC], vec![0x10, 0x40, 0x80, 0xc0]);
    }

    #[test]
    fn truncated_tail_is_ignored() {
        // A call opcode with fewer than `call_len` bytes remaining must not
        // be decoded.
        let text = [0x90, 0x90, 0x90, 0xe8];
        let info = info_with(0, &[0x1234], &[]);
        let pcs = read_cover_points(KernelArch::Amd64, &info, &text).unwrap();
        assert!(pcs[TRACE_PC].is_empty());
        assert!(pcs[TRACE_CMP].is_empty());
    }

    #[test]
    fn missing_trace_pc_symbol() {
        let info = info_with(0, &[], &[0x3000]);
        assert!(matches!(
            read_cover_points(KernelArch::Amd64, &info, &[0x90; 16]),
            Err(Error::NoTracePc)
        ));
    }

    #[test]
    fn arm64_scan_stride() {
        // The ARM64 scanner probes at 4-byte boundaries only: a BL pattern
        // at an unaligned offset must not match.
        let text_addr = 0x10000;
        let mut text = vec![0u8; 0x20];

        // Aligned BL at offset 8 targeting text_addr + 8 - 12.
        let imm = ((-3i32) as u32) & 0x03ff_ffff;
        let bl = 0x9400_0000u32 | imm;
        text[8..12].copy_from_slice(&bl.to_le_bytes());

        // The same encoding again at offset 18, off the 4-byte grid; its
        // would-be target is registered too and must still not be found.
        text[18..22].copy_from_slice(&bl.to_le_bytes());

        let target = text_addr + 8 - 12;
        let unaligned_target = text_addr + 18 - 12;
        let info = info_with(text_addr, &[target, unaligned_target], &[]);
        let pcs = read_cover_points(KernelArch::Arm64, &info, &text).unwrap();
        assert_eq!(pcs[TRACE_PC], vec![text_addr + 8]);
    }
}
