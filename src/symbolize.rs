// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Runtime PC symbolization.
//!
//! Resolves raw coverage PC samples into source frames by driving an
//! `addr2line`-style child process per worker. Each module gets its own
//! worker pool; within a pool, PCs flow to the workers in batches through a
//! multi-consumer channel. The pool size is capped hard at four: a single
//! `addr2line` on a large `vmlinux` can take around 1.6 GiB of RAM, and an
//! unbounded pool exhausts memory long before it wins any time back.

use crate::backend::{Frame, KernelDirs, KernelModule, LineRange, Target, LINE_END};
use crate::{paths, VirtAddr};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::io::{BufRead as _, BufReader, Write as _};
use std::num::NonZeroUsize;
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::{io, thread};

/// PCs per request batch sent to a worker.
const BATCH_SIZE: usize = 100;

/// Sentinel address appended to every batch; its echo marks the end of the
/// child's output for the batch.
const BATCH_END: VirtAddr = VirtAddr::MAX;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur during symbolization.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to start symbolizer {}: {}", .path, .source)]
    Spawn {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to symbolize: {}", .0)]
    Protocol(String),

    #[error("symbolizer IO error")]
    Io(#[from] io::Error),
}

/// Shares repeated strings (source paths, mostly) across all frames.
///
/// This is the only process-wide shared resource during symbolization; it
/// is synchronised internally. Symbolizing a large corpus yields millions
/// of frames referencing a few thousand distinct paths, so the sharing
/// bounds memory.
#[derive(Debug, Default)]
pub struct Interner(Mutex<HashSet<Arc<str>>>);

impl Interner {
    /// Returns a shared copy of `s`.
    pub fn intern(&self, s: &str) -> Arc<str> {
        let mut strings = self.0.lock().expect("interner poisoned");
        if let Some(existing) = strings.get(s) {
            return existing.clone();
        }
        let shared: Arc<str> = Arc::from(s);
        strings.insert(shared.clone());
        shared
    }
}

/// Everything a symbolization request needs, owned by the backend façade.
#[derive(Debug)]
pub struct Context {
    target: Target,
    kernel_dirs: KernelDirs,
    split_build_delimiters: Vec<String>,
    interner: Interner,
}

impl Context {
    /// Creates a symbolization context.
    pub fn new(
        target: Target,
        kernel_dirs: KernelDirs,
        split_build_delimiters: Vec<String>,
    ) -> Self {
        Self {
            target,
            kernel_dirs,
            split_build_delimiters,
            interner: Interner::default(),
        }
    }
}

/// One frame as reported by the child, still in file address space.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawFrame {
    pc: VirtAddr,
    func: String,
    file: String,
    line: u32,
    inline: bool,
}

/// A long-lived `addr2line -afi` child.
///
/// Owned by exactly one worker thread; killed and reaped on drop.
struct Symbolizer {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Symbolizer {
    fn spawn(binary: &Path, object: &Path) -> Result<Self> {
        let mut child = Command::new(binary)
            .arg("-afi")
            .arg("-e")
            .arg(object)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| Error::Spawn {
                path: binary.display().to_string(),
                source,
            })?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));

        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    /// Resolves one batch of (file address space) PCs.
    ///
    /// The protocol: one hex address per line, echoed back by the child
    /// (`-a`) followed by `func` + `file:line` pairs, several per address
    /// when inlining is involved (`-i`). The batch is terminated by a
    /// sentinel address; the sentinel's own output is left in the pipe and
    /// skipped at the start of the next batch.
    fn symbolize(&mut self, pcs: &[VirtAddr]) -> Result<Vec<RawFrame>> {
        if pcs.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = String::new();
        for pc in pcs {
            request.push_str(&format!("{pc:#x}\n"));
        }
        request.push_str(&format!("{BATCH_END:#x}\n"));
        self.stdin.write_all(request.as_bytes())?;
        self.stdin.flush()?;

        let mut frames = Vec::new();
        let mut group: SmallVec<[(String, String); 4]> = SmallVec::new();
        let mut group_pc: Option<VirtAddr> = None;
        let mut line = String::new();

        loop {
            line.clear();
            if self.stdout.read_line(&mut line)? == 0 {
                return Err(Error::Protocol("symbolizer exited mid-batch".to_owned()));
            }
            let trimmed = line.trim_end();

            if let Some(hex) = trimmed.strip_prefix("0x") {
                let addr = VirtAddr::from_str_radix(hex, 16)
                    .map_err(|_| Error::Protocol(format!("bad address echo {trimmed:?}")))?;
                if let Some(pc) = group_pc.take() {
                    flush_group(&mut frames, pc, &mut group);
                }
                if addr == BATCH_END {
                    return Ok(frames);
                }
                group_pc = Some(addr);
            } else if group_pc.is_some() {
                // Function-name line; the location line follows.
                let func = trimmed.to_owned();
                line.clear();
                if self.stdout.read_line(&mut line)? == 0 {
                    return Err(Error::Protocol("symbolizer exited mid-frame".to_owned()));
                }
                group.push((func, line.trim_end().to_owned()));
            }
            // Anything else is the stale tail of the previous batch's
            // sentinel output; skip it.
        }
    }
}

impl Drop for Symbolizer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Converts one address group into raw frames, innermost first.
fn flush_group(
    frames: &mut Vec<RawFrame>,
    pc: VirtAddr,
    group: &mut SmallVec<[(String, String); 4]>,
) {
    let depth = group.len();
    for (i, (func, loc)) in group.drain(..).enumerate() {
        let (file, line) = parse_location(&loc);
        frames.push(RawFrame {
            pc,
            func,
            file,
            line,
            // All but the outermost frame of a group are inline.
            inline: i + 1 < depth,
        });
    }
}

/// Splits an addr2line location like `fs/inode.c:123 (discriminator 2)`.
fn parse_location(loc: &str) -> (String, u32) {
    let loc = match loc.split_once(" (") {
        Some((head, _)) => head,
        None => loc,
    };
    let Some((file, line)) = loc.rsplit_once(':') else {
        return (loc.to_owned(), 0);
    };
    (file.to_owned(), line.parse().unwrap_or(0))
}

/// Worker-pool size for one module.
fn worker_count(pcs: usize) -> usize {
    let cores = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    worker_count_for(cores, pcs)
}

fn worker_count_for(cores: usize, pcs: usize) -> usize {
    (cores / 2).min(pcs / 1000).clamp(1, 4)
}

/// Symbolizes the PCs of several modules concurrently.
///
/// The first failure is returned after all workers have drained, so every
/// child process winds down cleanly. Frame order across modules is
/// unspecified.
pub fn symbolize(
    ctx: &Context,
    pcs: HashMap<Arc<KernelModule>, Vec<VirtAddr>>,
) -> Result<Vec<Frame>> {
    thread::scope(|scope| {
        let (tx, rx) = mpsc::sync_channel(pcs.len().max(1));
        for (module, module_pcs) in &pcs {
            let tx = tx.clone();
            scope.spawn(move || {
                let _ = tx.send(symbolize_module(ctx, module, module_pcs));
            });
        }
        drop(tx);

        let mut frames = Vec::new();
        let mut first_err = None;
        while let Ok(result) = rx.recv() {
            match result {
                Ok(module_frames) => frames.extend(module_frames),
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(frames),
        }
    })
}

/// Symbolizes one module's PCs with a bounded worker pool.
fn symbolize_module(
    ctx: &Context,
    module: &Arc<KernelModule>,
    pcs: &[VirtAddr],
) -> Result<Vec<Frame>> {
    struct WorkerResult {
        frames: Vec<RawFrame>,
        err: Option<Error>,
    }

    let procs = worker_count(pcs.len());

    let raw_frames = thread::scope(|scope| {
        // Work queue: multi-consumer, so the std mpsc receiver won't do.
        let (pc_tx, pc_rx) = crossbeam_channel::bounded::<Vec<VirtAddr>>(procs);
        let (result_tx, result_rx) = mpsc::sync_channel(procs);

        for _ in 0..procs {
            let pc_rx = pc_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                let mut result = WorkerResult {
                    frames: Vec::new(),
                    err: None,
                };

                let mut symb = match Symbolizer::spawn(&ctx.target.addr2line, &module.path) {
                    Ok(symb) => Some(symb),
                    Err(err) => {
                        result.err = Some(err);
                        None
                    }
                };

                // Keep draining after a failure so the producer never blocks
                // on a full channel.
                while let Ok(batch) = pc_rx.recv() {
                    let Some(symb) = symb.as_mut() else { continue };
                    if result.err.is_some() {
                        continue;
                    }
                    match symb.symbolize(&batch) {
                        Ok(frames) => result.frames.extend(frames),
                        Err(err) => result.err = Some(err),
                    }
                }

                let _ = result_tx.send(result);
            });
        }
        drop(pc_rx);
        drop(result_tx);

        // Produce batches, un-relocated into the module's file space.
        for chunk in pcs.chunks(BATCH_SIZE) {
            let batch: Vec<VirtAddr> = chunk
                .iter()
                .map(|&pc| {
                    if module.is_main() {
                        pc
                    } else {
                        pc.wrapping_sub(module.addr)
                    }
                })
                .collect();
            if pc_tx.send(batch).is_err() {
                break;
            }
        }
        drop(pc_tx);

        let mut frames = Vec::new();
        let mut first_err = None;
        while let Ok(result) = result_rx.recv() {
            if let Some(err) = result.err {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
            frames.extend(result.frames);
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(frames),
        }
    })?;

    // Lift the raw frames back into runtime address space and canonical
    // source paths.
    let mut frames = Vec::with_capacity(raw_frames.len());
    for raw in raw_frames {
        let (name, path) =
            paths::clean_path(&raw.file, &ctx.kernel_dirs, &ctx.split_build_delimiters);
        let pc = if module.is_main() {
            raw.pc
        } else {
            raw.pc.wrapping_add(module.addr)
        };
        frames.push(Frame {
            module: module.clone(),
            pc,
            name: ctx.interner.intern(&name),
            func_name: raw.func,
            path: ctx.interner.intern(&path),
            inline: raw.inline,
            range: LineRange {
                start_line: raw.line,
                start_col: 0,
                end_line: raw.line,
                end_col: LINE_END,
            },
        });
    }

    Ok(frames)
}
