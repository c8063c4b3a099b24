// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Slow-path cover-point discovery through an external disassembler.
//!
//! Architectures without a fast in-process call decoder get their cover
//! points by running the target's `objdump -d` and scanning the textual
//! output for direct calls to `__sanitizer_cov_trace_pc` (and its per-arch
//! aliases). Output on a kernel image is huge, so stdout is streamed rather
//! than collected. Only trace-pc points are recoverable this way.

use crate::arch::KernelArch;
use crate::backend::{KernelModule, Target};
use crate::scan::{CoverPoints, TRACE_PC};
use crate::VirtAddr;
use std::io::{BufRead as _, BufReader, Read as _};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::{io, str};

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur while running the disassembler.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("objdump scanning is not supported for {}", .0.name())]
    UnsupportedArch(KernelArch),

    #[error("failed to run objdump on {}: {}", .path.display(), .source)]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to run objdump on {}: {}\n{}", .path.display(), .reason, .stderr)]
    Failed {
        path: PathBuf,
        reason: String,
        stderr: String,
    },
}

/// Kills and reaps the child on every exit path.
struct Reaper(Option<Child>);

impl Reaper {
    /// Waits for the child to exit normally, disarming the kill.
    fn wait(&mut self) -> io::Result<ExitStatus> {
        self.0.take().expect("child already reaped").wait()
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if let Some(child) = &mut self.0 {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Finds all trace-pc cover points in a module by disassembling it.
pub fn scan(target: &Target, module: &KernelModule) -> Result<CoverPoints> {
    let (call_insns, trace_funcs) = arch_call_insn(target.arch)?;

    let mut cmd = Command::new(&target.objdump);
    cmd.arg("-d")
        .arg("--no-show-raw-insn")
        .arg(&module.path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| Error::Spawn {
        path: module.path.clone(),
        source,
    })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");
    let mut child = Reaper(Some(child));

    let fail = |reason: String, stderr: String| Error::Failed {
        path: module.path.clone(),
        reason,
        stderr,
    };

    let mut pcs: CoverPoints = Default::default();
    for line in BufReader::new(stdout).split(b'\n') {
        let line = line.map_err(|e| fail(e.to_string(), String::new()))?;
        if let Some(pc) = parse_line(call_insns, trace_funcs, &line) {
            if module.is_main() {
                pcs[TRACE_PC].push(pc);
            } else {
                pcs[TRACE_PC].push(pc + module.addr);
            }
        }
    }

    // objdump's stderr is small; reading it only after stdout has drained is
    // fine and keeps this single-threaded.
    let mut stderr_out = String::new();
    let _ = stderr.read_to_string(&mut stderr_out);

    let status = child
        .wait()
        .map_err(|e| fail(e.to_string(), stderr_out.clone()))?;
    if !status.success() {
        return Err(fail(status.to_string(), stderr_out));
    }

    Ok(pcs)
}

/// Extracts the PC of a cover-point call from one line of objdump output.
///
/// A line matches if it contains one of the call mnemonics followed
/// (somewhere to the right) by one of the trace-callback name tokens; the PC
/// is the leading hex number before the first `:`.
fn parse_line(
    call_insns: &[&[u8]],
    trace_funcs: &[&[u8]],
    line: &[u8],
) -> Option<VirtAddr> {
    let pos = call_insns
        .iter()
        .find_map(|insn| find_subslice(line, insn))?;

    trace_funcs
        .iter()
        .find(|func| find_subslice(&line[pos..], func).is_some())?;

    let line = match line.iter().position(|&b| b != b' ') {
        Some(start) => &line[start..],
        None => return None,
    };
    let colon = line.iter().position(|&b| b == b':')?;
    let pc = str::from_utf8(&line[..colon]).ok()?;

    VirtAddr::from_str_radix(pc, 16).ok()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Call mnemonics and trace-callback name tokens per architecture.
///
/// The examples in the comments are real objdump output lines.
fn arch_call_insn(
    arch: KernelArch,
) -> Result<(&'static [&'static [u8]], &'static [&'static [u8]])> {
    const CALL_NAME: &[&[u8]] = &[b" <__sanitizer_cov_trace_pc>"];

    Ok(match arch {
        // c1000102:       call   c10001f0 <__sanitizer_cov_trace_pc>
        KernelArch::I386 => (&[b"\tcall "], CALL_NAME),

        // ffff0000080d9cc0:       bl      ffff00000820f478 <__sanitizer_cov_trace_pc>
        KernelArch::Arm64 => (
            &[b"\tbl "],
            &[
                b"<__sanitizer_cov_trace_pc>",
                b"<____sanitizer_cov_trace_pc_veneer>",
            ],
        ),

        // 8010252c:       bl      801c3280 <__sanitizer_cov_trace_pc>
        KernelArch::Arm => (&[b"\tbl\t"], CALL_NAME),

        // c00000000006d904:       bl      c000000000350780 <.__sanitizer_cov_trace_pc>
        // This is only known to occur in the test:
        // 838:   bl      824 <__sanitizer_cov_trace_pc+0x8>
        // This occurs on PPC64LE:
        // c0000000001c21a8:       bl      c0000000002df4a0 <__sanitizer_cov_trace_pc>
        KernelArch::Ppc64le => (
            &[b"\tbl "],
            &[
                b"<__sanitizer_cov_trace_pc>",
                b"<__sanitizer_cov_trace_pc+0x8>",
                b" <.__sanitizer_cov_trace_pc>",
            ],
        ),

        // ffffffff80100420:       jal     ffffffff80205880 <__sanitizer_cov_trace_pc>
        // This is only known to occur in the test:
        // b58:   bal     b30 <__sanitizer_cov_trace_pc>
        KernelArch::Mips64le => (&[b"\tjal\t", b"\tbal\t"], CALL_NAME),

        // 1001de:       brasl   %r14,2bc090 <__sanitizer_cov_trace_pc>
        KernelArch::S390x => (&[b"\tbrasl\t"], CALL_NAME),

        // ffffffe000200018:       jal     ra,ffffffe0002935b0 <__sanitizer_cov_trace_pc>
        // ffffffe0000010da:       jalr    1242(ra) # ffffffe0002935b0 <__sanitizer_cov_trace_pc>
        KernelArch::RiscV64 => (&[b"\tjal\t", b"\tjalr\t"], CALL_NAME),

        other => return Err(Error::UnsupportedArch(other)),
    })
}
