// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Coverage attribution backend: the data model and the per-module
//! orchestration.
//!
//! [`make`] drives one discovery pipeline per kernel binary (symbol reading,
//! cover-point scanning, DWARF range extraction) on its own thread, drains
//! the per-module results through a bounded channel, hands the aggregate to
//! [`crate::assemble`] and wraps the outcome in the [`Impl`] façade that
//! fuzzing callers consume.

use crate::arch::KernelArch;
use crate::ranges::PcRange;
use crate::scan::{self, CoverPoints, TRACE_CMP, TRACE_PC};
use crate::symbols::SymbolInfo;
use crate::{assemble, debug, objdump, objfile, ranges, symbolize, AnyError, VirtAddr};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, LazyLock};
use std::{panic, thread};

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors surfaced at the module boundary.
///
/// The first failing module aborts the whole build.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// ELF/DWARF parse failure, including trapped parser panics.
    #[error("failed to parse ELF/DWARF data: {0}")]
    Format(#[source] AnyError),

    /// The main image has no coverage callbacks at all.
    #[error("{} doesn't contain coverage callbacks (set CONFIG_KCOV=y on linux)", .0.display())]
    MissingSymbols(PathBuf),

    /// Attribution left no symbols or no units.
    #[error("failed to parse DWARF (set CONFIG_DEBUG_INFO=y on linux)")]
    NoCoverage,

    /// The objdump fallback failed.
    #[error("disassembler failed")]
    Disassembler(#[from] objdump::Error),

    /// Runtime symbolization failed.
    #[error("symbolizer failed")]
    Symbolizer(#[from] symbolize::Error),

    /// Plain file I/O failure.
    #[error("IO error")]
    Io(#[from] std::io::Error),
}

impl From<objfile::Error> for Error {
    fn from(e: objfile::Error) -> Self {
        Self::Format(Box::new(e))
    }
}

impl From<crate::symbols::Error> for Error {
    fn from(e: crate::symbols::Error) -> Self {
        Self::Format(Box::new(e))
    }
}

impl From<ranges::Error> for Error {
    fn from(e: ranges::Error) -> Self {
        Self::Format(Box::new(e))
    }
}

impl From<assemble::Error> for Error {
    fn from(e: assemble::Error) -> Self {
        match e {
            assemble::Error::NoCoverage => Self::NoCoverage,
        }
    }
}

/// Target descriptor, supplied by the caller.
#[derive(Debug, Clone)]
pub struct Target {
    /// Operating system name (`linux`, ...).
    pub os: String,

    /// Kernel architecture.
    pub arch: KernelArch,

    /// Pointer size on the target, in bytes.
    pub ptr_size: u64,

    /// C compiler used for the build, as configured by the caller.
    pub ccompiler: String,

    /// Target-compatible `objdump` binary, for the slow discovery path.
    pub objdump: PathBuf,

    /// `addr2line`-equivalent binary used for symbolization.
    pub addr2line: PathBuf,
}

/// One kernel binary: the main image or a loadable module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelModule {
    /// Module name; empty for the main image.
    pub name: String,

    /// On-disk path of the binary.
    pub path: PathBuf,

    /// Runtime load address. Meaningless for the main image, whose
    /// addresses are already absolute.
    pub addr: VirtAddr,
}

impl KernelModule {
    /// Whether this is the main kernel image.
    pub fn is_main(&self) -> bool {
        self.name.is_empty()
    }
}

/// The kernel source/build directory triple used for path canonicalisation.
#[derive(Debug, Clone, Default)]
pub struct KernelDirs {
    /// Source checkout.
    pub src: String,

    /// Object/build output directory.
    pub obj: String,

    /// Directory the kernel was originally built in (paths recorded in
    /// debug info may still point there).
    pub build_src: String,
}

/// A function symbol with its attributed cover points.
///
/// `[start, end)`, with `pcs`/`cmps` non-empty only for symbols that
/// actually contain callback sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// First address of the function.
    pub start: VirtAddr,

    /// One past the last address of the function.
    pub end: VirtAddr,

    /// Symbol name.
    pub name: String,

    /// Index of the owning unit in [`Impl::units`]; assigned during
    /// assembly.
    pub unit: usize,

    /// Trace-pc cover points inside the function, ascending.
    pub pcs: Vec<VirtAddr>,

    /// Comparison cover points inside the function, ascending.
    pub cmps: Vec<VirtAddr>,
}

/// A DWARF compile unit with its attributed cover points.
#[derive(Debug, Clone)]
pub struct CompileUnit {
    /// Canonical display path of the unit's source file.
    pub name: String,

    /// Absolute on-disk path of the source file.
    pub path: String,

    /// Binary this unit was compiled into.
    pub module: Arc<KernelModule>,

    /// Trace-pc cover points of all symbols in the unit, ascending.
    pub pcs: Vec<VirtAddr>,

    /// Comparison cover points of all symbols in the unit, ascending.
    pub cmps: Vec<VirtAddr>,
}

/// Sentinel column value meaning "until the end of the line".
pub const LINE_END: u32 = 1 << 30;

/// Source location span of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    /// First line, 1-based.
    pub start_line: u32,
    /// First column; always 0 here.
    pub start_col: u32,
    /// Last line.
    pub end_line: u32,
    /// Last column; [`LINE_END`] means end-of-line.
    pub end_col: u32,
}

/// One source-level frame resolved from a raw PC sample.
///
/// A single PC yields one frame per inline level.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Module the PC belongs to.
    pub module: Arc<KernelModule>,

    /// The sample PC, in runtime address space.
    pub pc: VirtAddr,

    /// Canonical display path of the source file (interned).
    pub name: Arc<str>,

    /// Function name.
    pub func_name: String,

    /// Absolute source file path (interned).
    pub path: Arc<str>,

    /// Whether this frame was inlined into its caller.
    pub inline: bool,

    /// Source span.
    pub range: LineRange,
}

/// The pluggable per-platform object readers.
///
/// Exactly one implementation is chosen per platform;
/// [`crate::elf::ElfReaders`] covers ELF/DWARF kernels.
pub trait ObjectReaders: Sync {
    /// Reads the function symbols of a module and fills in the callback
    /// sets.
    fn read_symbols(&self, module: &KernelModule, info: &mut SymbolInfo) -> Result<Vec<Symbol>>;

    /// Reads the text-section bytes of the main image.
    fn read_text_data(&self, module: &KernelModule) -> Result<Vec<u8>>;

    /// Reads the cover points of a loadable module.
    fn read_module_cover_points(
        &self,
        target: &Target,
        module: &KernelModule,
        info: &SymbolInfo,
    ) -> Result<CoverPoints>;

    /// Reads the DWARF compile-unit ranges of a module. Range `unit` fields
    /// index into the returned unit list.
    fn read_text_ranges(
        &self,
        module: &Arc<KernelModule>,
    ) -> Result<(Vec<PcRange>, Vec<CompileUnit>)>;

    /// Returns the (free-form) version string of the compiler that built the
    /// given module.
    fn get_compiler_version(&self, module: &KernelModule) -> String;
}

/// Everything [`make`] needs.
pub struct Params<R> {
    /// Target descriptor.
    pub target: Target,

    /// Directory triple for path canonicalisation.
    pub kernel_dirs: KernelDirs,

    /// Android split-tree markers, e.g. `"/common/"`.
    pub split_build_delimiters: Vec<String>,

    /// All kernel binaries; exactly one entry must be the main image.
    pub modules: Vec<KernelModule>,

    /// Platform reader set.
    pub readers: R,
}

/// The assembled coverage map of one kernel build.
#[derive(Debug)]
pub struct Impl {
    /// Retained compile units, each with at least one cover point.
    pub units: Vec<CompileUnit>,

    /// Retained symbols, sorted by start address, unique starts.
    pub symbols: Vec<Symbol>,

    /// All trace-pc cover points across all modules, ascending.
    pub callback_points: Vec<VirtAddr>,

    /// False if any module was built with a compiler whose KCOV
    /// instrumentation is known to be imprecise.
    pub precise_coverage: bool,

    symbolizer: symbolize::Context,
}

impl Impl {
    /// Resolves raw runtime PC samples into source frames.
    ///
    /// Frame order across modules is unspecified; within one module it
    /// follows the request order.
    pub fn symbolize(
        &self,
        pcs: HashMap<Arc<KernelModule>, Vec<VirtAddr>>,
    ) -> Result<Vec<Frame>> {
        symbolize::symbolize(&self.symbolizer, pcs).map_err(Error::from)
    }
}

/// Per-module discovery output, drained through the result channel.
struct ModuleResult {
    symbols: Vec<Symbol>,
    cover_points: CoverPoints,
    ranges: Vec<PcRange>,
    units: Vec<CompileUnit>,
}

/// Builds the coverage map for a kernel build.
///
/// This is a thin shell around [`make_inner`] that traps panics out of
/// third-party object/DWARF parsing and converts them into [`Error::Format`]
/// so a malformed input can never abort the process.
pub fn make<R: ObjectReaders>(params: Params<R>) -> Result<Impl> {
    panic::catch_unwind(panic::AssertUnwindSafe(|| make_inner(params))).unwrap_or_else(|cause| {
        let msg = if let Some(s) = cause.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = cause.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_owned()
        };
        Err(Error::Format(
            format!("panic while parsing DWARF: {msg}").into(),
        ))
    })
}

fn make_inner<R: ObjectReaders>(params: Params<R>) -> Result<Impl> {
    let modules: Vec<Arc<KernelModule>> =
        params.modules.iter().cloned().map(Arc::new).collect();
    let target = &params.target;
    let readers = &params.readers;

    struct Aggregate {
        symbols: Vec<Symbol>,
        cover_points: CoverPoints,
        ranges: Vec<PcRange>,
        units: Vec<CompileUnit>,
        precise_coverage: bool,
        first_err: Option<Error>,
    }

    let agg = thread::scope(|scope| {
        let (tx, rx) = mpsc::sync_channel::<Result<ModuleResult>>(modules.len());

        for module in &modules {
            let tx = tx.clone();
            let module = module.clone();
            scope.spawn(move || {
                let _ = tx.send(process_module(readers, target, &module));
            });
        }
        drop(tx);

        let mut agg = Aggregate {
            symbols: Vec::new(),
            cover_points: Default::default(),
            ranges: Vec::new(),
            units: Vec::new(),
            precise_coverage: true,
            first_err: None,
        };

        for module in &modules {
            if is_kcov_broken_in_compiler(&readers.get_compiler_version(module)) {
                agg.precise_coverage = false;
            }
        }

        for _ in &modules {
            let Ok(result) = rx.recv() else {
                break; // a worker died without reporting; scope re-raises
            };
            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    if agg.first_err.is_none() {
                        agg.first_err = Some(err);
                    }
                    continue; // keep draining so all children wind down
                }
            };

            // Rebase the module-local unit indices into the aggregate list.
            let unit_base = agg.units.len();
            agg.units.extend(result.units);
            agg.ranges.extend(result.ranges.into_iter().map(|mut r| {
                r.unit += unit_base;
                r
            }));
            agg.symbols.extend(result.symbols);
            let [pcs, cmps] = result.cover_points;
            agg.cover_points[TRACE_PC].extend(pcs);
            agg.cover_points[TRACE_CMP].extend(cmps);
        }

        agg
    });

    if let Some(err) = agg.first_err {
        return Err(err);
    }

    debug!(
        "discovered {} source files, {} symbols",
        agg.units.len(),
        agg.symbols.len()
    );

    let assembled = assemble::assemble(
        assemble::Input {
            symbols: agg.symbols,
            ranges: agg.ranges,
            cover_points: agg.cover_points,
            units: agg.units,
        },
        &params.kernel_dirs,
        &params.split_build_delimiters,
    )?;

    Ok(Impl {
        units: assembled.units,
        symbols: assembled.symbols,
        callback_points: assembled.callback_points,
        precise_coverage: agg.precise_coverage,
        symbolizer: symbolize::Context::new(
            params.target,
            params.kernel_dirs,
            params.split_build_delimiters,
        ),
    })
}

/// Runs symbol reading, cover-point discovery and range extraction for one
/// module.
fn process_module<R: ObjectReaders>(
    readers: &R,
    target: &Target,
    module: &Arc<KernelModule>,
) -> Result<ModuleResult> {
    let mut info = SymbolInfo::default();
    let symbols = readers.read_symbols(module, &mut info)?;

    let cover_points = if target.arch.call_decoder().is_none() {
        objdump::scan(target, module)?
    } else if module.is_main() {
        let data = readers.read_text_data(module)?;
        match scan::read_cover_points(target.arch, &info, &data) {
            Ok(pcs) => pcs,
            Err(scan::Error::NoTracePc) => {
                return Err(Error::MissingSymbols(module.path.clone()))
            }
            Err(e) => return Err(Error::Format(Box::new(e))),
        }
    } else {
        readers.read_module_cover_points(target, module, &info)?
    };

    if module.is_main() && cover_points[TRACE_PC].is_empty() {
        return Err(Error::MissingSymbols(module.path.clone()));
    }

    let (ranges, units) = readers.read_text_ranges(module)?;

    Ok(ModuleResult {
        symbols,
        cover_points,
        ranges,
        units,
    })
}

// Some targets (e.g. NetBSD) use g++ instead of gcc.
static GCC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"gcc|GCC|g\+\+").expect("static regex"));
static GCC_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(gcc|GCC|g\+\+).* ([0-9]{1,2})\.[0-9]+\.[0-9]+").expect("static regex")
});

/// GCC < 14 tail-calls KCOV callbacks, which breaks the assumption that
/// every collected coverage PC has a matching enumerated callback site.
///
/// If the vendor matches but the version cannot be parsed, the compiler is
/// assumed broken.
pub fn is_kcov_broken_in_compiler(version: &str) -> bool {
    if !GCC_RE.is_match(version) {
        return false;
    }
    if let Some(groups) = GCC_VERSION_RE.captures(version) {
        if let Ok(major) = groups[2].parse::<u32>() {
            return major < 14;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::call_e8;
    use std::collections::HashMap;

    #[test]
    fn broken_compilers() {
        assert!(is_kcov_broken_in_compiler("gcc 13.2.0"));
        assert!(is_kcov_broken_in_compiler("g++ 11.4.0"));
        assert!(is_kcov_broken_in_compiler(
            "gcc (Debian 12.2.0-14) 12.2.0"
        ));
        // Vendor matches but no parseable version: assume broken.
        assert!(is_kcov_broken_in_compiler("gcc"));

        assert!(!is_kcov_broken_in_compiler("gcc 14.0.1"));
        assert!(!is_kcov_broken_in_compiler("GCC 15.1.0"));
        assert!(!is_kcov_broken_in_compiler("clang 17"));
        assert!(!is_kcov_broken_in_compiler(
            "Debian clang version 16.0.6"
        ));
    }

    /// Canned per-module data standing in for real binaries.
    #[derive(Default, Clone)]
    struct MockModule {
        text_addr: VirtAddr,
        trace_pc: Vec<VirtAddr>,
        trace_cmp: Vec<VirtAddr>,
        symbols: Vec<(&'static str, VirtAddr, VirtAddr)>, // (name, start, end)
        text: Vec<u8>,
        module_cover: CoverPoints,
        ranges: Vec<(VirtAddr, VirtAddr, usize)>,
        units: Vec<&'static str>,
        compiler: &'static str,
    }

    #[derive(Default)]
    struct MockReaders {
        modules: HashMap<String, MockModule>,
    }

    impl MockReaders {
        fn module(&self, module: &KernelModule) -> &MockModule {
            &self.modules[&module.name]
        }
    }

    impl ObjectReaders for MockReaders {
        fn read_symbols(
            &self,
            module: &KernelModule,
            info: &mut SymbolInfo,
        ) -> Result<Vec<Symbol>> {
            let mock = self.module(module);
            info.text_addr = mock.text_addr;
            info.trace_pc = mock.trace_pc.iter().copied().collect();
            info.trace_cmp = mock.trace_cmp.iter().copied().collect();
            Ok(mock
                .symbols
                .iter()
                .map(|&(name, start, end)| Symbol {
                    start,
                    end,
                    name: name.to_owned(),
                    unit: 0,
                    pcs: Vec::new(),
                    cmps: Vec::new(),
                })
                .collect())
        }

        fn read_text_data(&self, module: &KernelModule) -> Result<Vec<u8>> {
            Ok(self.module(module).text.clone())
        }

        fn read_module_cover_points(
            &self,
            _target: &Target,
            module: &KernelModule,
            _info: &SymbolInfo,
        ) -> Result<CoverPoints> {
            Ok(self.module(module).module_cover.clone())
        }

        fn read_text_ranges(
            &self,
            module: &Arc<KernelModule>,
        ) -> Result<(Vec<PcRange>, Vec<CompileUnit>)> {
            let mock = self.module(module);
            let ranges = mock
                .ranges
                .iter()
                .map(|&(start, end, unit)| PcRange { start, end, unit })
                .collect();
            let units = mock
                .units
                .iter()
                .map(|&name| CompileUnit {
                    name: name.to_owned(),
                    path: String::new(),
                    module: module.clone(),
                    pcs: Vec::new(),
                    cmps: Vec::new(),
                })
                .collect();
            Ok((ranges, units))
        }

        fn get_compiler_version(&self, module: &KernelModule) -> String {
            self.module(module).compiler.to_owned()
        }
    }

    fn target() -> Target {
        Target {
            os: "linux".to_owned(),
            ptr_size: 8,
            ccompiler: "clang".to_owned(),
            arch: KernelArch::Amd64,
            objdump: "objdump".into(),
            addr2line: "addr2line".into(),
        }
    }

    fn dirs() -> KernelDirs {
        KernelDirs {
            src: "/src".to_owned(),
            obj: "/obj".to_owned(),
            build_src: "/bsrc".to_owned(),
        }
    }

    fn main_module() -> KernelModule {
        KernelModule {
            name: String::new(),
            path: "/obj/vmlinux".into(),
            addr: 0,
        }
    }

    /// Main image with funcA/funcB, two trace-pc calls and one cmp call.
    fn main_mock() -> MockModule {
        let text_addr = 0x100;
        let mut text = vec![0x90u8; 0x40];
        text[0x04..0x09].copy_from_slice(&call_e8(0x104, 0x200));
        text[0x24..0x29].copy_from_slice(&call_e8(0x124, 0x200));
        text[0x30..0x35].copy_from_slice(&call_e8(0x130, 0x300));

        MockModule {
            text_addr,
            trace_pc: vec![0x200],
            trace_cmp: vec![0x300],
            symbols: vec![("funcA", 0x100, 0x120), ("funcB", 0x120, 0x140)],
            text,
            ranges: vec![(0x100, 0x140, 0)],
            units: vec!["kernel/foo.c"],
            compiler: "clang 17",
            ..Default::default()
        }
    }

    #[test]
    fn single_image_end_to_end() {
        let mut readers = MockReaders::default();
        readers.modules.insert(String::new(), main_mock());

        let built = make(Params {
            target: target(),
            kernel_dirs: dirs(),
            split_build_delimiters: vec![],
            modules: vec![main_module()],
            readers,
        })
        .unwrap();

        assert_eq!(built.callback_points, vec![0x104, 0x124]);
        assert!(built.precise_coverage);

        assert_eq!(built.symbols.len(), 2);
        let func_a = &built.symbols[0];
        assert_eq!(func_a.name, "funcA");
        assert_eq!(func_a.pcs, vec![0x104]);
        assert!(func_a.cmps.is_empty());
        let func_b = &built.symbols[1];
        assert_eq!(func_b.name, "funcB");
        assert_eq!(func_b.pcs, vec![0x124]);
        assert_eq!(func_b.cmps, vec![0x130]);

        assert_eq!(built.units.len(), 1);
        let unit = &built.units[0];
        assert_eq!(unit.name, "kernel/foo.c");
        assert_eq!(unit.path, "/src/kernel/foo.c");
        assert_eq!(unit.pcs, vec![0x104, 0x124]);
        assert_eq!(unit.cmps, vec![0x130]);
        assert_eq!(func_a.unit, 0);
        assert_eq!(func_b.unit, 0);
    }

    #[test]
    fn loadable_module_cover_points_are_absolute() {
        const BASE: VirtAddr = 0xffff_8000_0000_0000;

        let mut readers = MockReaders::default();
        readers.modules.insert(String::new(), main_mock());
        readers.modules.insert(
            "dummy".to_owned(),
            MockModule {
                symbols: vec![("mod_func", BASE + 0x30, BASE + 0x80)],
                module_cover: [vec![BASE + 0x40], vec![]],
                ranges: vec![(BASE + 0x30, BASE + 0x80, 0)],
                units: vec!["drivers/dummy/main.c"],
                compiler: "gcc 14.2.0",
                ..Default::default()
            },
        );

        let built = make(Params {
            target: target(),
            kernel_dirs: dirs(),
            split_build_delimiters: vec![],
            modules: vec![
                main_module(),
                KernelModule {
                    name: "dummy".to_owned(),
                    path: "/obj/dummy.ko".into(),
                    addr: BASE,
                },
            ],
            readers,
        })
        .unwrap();

        assert_eq!(built.callback_points, vec![0x104, 0x124, BASE + 0x40]);
        assert_eq!(built.units.len(), 2);
        assert_eq!(built.symbols.len(), 3);

        let mod_func = built.symbols.iter().find(|s| s.name == "mod_func").unwrap();
        assert_eq!(mod_func.pcs, vec![BASE + 0x40]);
        let mod_unit = &built.units[mod_func.unit];
        assert_eq!(mod_unit.name, "drivers/dummy/main.c");
        assert_eq!(mod_unit.module.name, "dummy");
        assert_eq!(mod_unit.pcs, vec![BASE + 0x40]);
    }

    #[test]
    fn missing_kcov_symbol() {
        let mut readers = MockReaders::default();
        let mut mock = main_mock();
        mock.trace_pc.clear();
        readers.modules.insert(String::new(), mock);

        let err = make(Params {
            target: target(),
            kernel_dirs: dirs(),
            split_build_delimiters: vec![],
            modules: vec![main_module()],
            readers,
        })
        .unwrap_err();

        assert!(matches!(err, Error::MissingSymbols(_)));
        assert!(err.to_string().contains("CONFIG_KCOV"), "{err}");
    }

    #[test]
    fn broken_compiler_clears_precise_coverage() {
        let mut readers = MockReaders::default();
        let mut mock = main_mock();
        mock.compiler = "gcc 13.2.0";
        readers.modules.insert(String::new(), mock);

        let built = make(Params {
            target: target(),
            kernel_dirs: dirs(),
            split_build_delimiters: vec![],
            modules: vec![main_module()],
            readers,
        })
        .unwrap();

        assert!(!built.precise_coverage);
    }

    #[test]
    fn no_attributable_coverage() {
        let mut readers = MockReaders::default();
        let mut mock = main_mock();
        mock.ranges.clear(); // no DWARF ranges: every symbol is dropped
        readers.modules.insert(String::new(), mock);

        let err = make(Params {
            target: target(),
            kernel_dirs: dirs(),
            split_build_delimiters: vec![],
            modules: vec![main_module()],
            readers,
        })
        .unwrap_err();

        assert!(matches!(err, Error::NoCoverage));
        assert!(err.to_string().contains("CONFIG_DEBUG_INFO"), "{err}");
    }

    /// Readers standing in for a DWARF parser that aborts on malformed
    /// input instead of returning an error.
    struct AbortingReaders;

    impl ObjectReaders for AbortingReaders {
        fn read_symbols(
            &self,
            _module: &KernelModule,
            _info: &mut SymbolInfo,
        ) -> Result<Vec<Symbol>> {
            panic!("entry offset out of bounds");
        }

        fn read_text_data(&self, _module: &KernelModule) -> Result<Vec<u8>> {
            unreachable!()
        }

        fn read_module_cover_points(
            &self,
            _target: &Target,
            _module: &KernelModule,
            _info: &SymbolInfo,
        ) -> Result<CoverPoints> {
            unreachable!()
        }

        fn read_text_ranges(
            &self,
            _module: &Arc<KernelModule>,
        ) -> Result<(Vec<PcRange>, Vec<CompileUnit>)> {
            unreachable!()
        }

        fn get_compiler_version(&self, _module: &KernelModule) -> String {
            String::new()
        }
    }

    #[test]
    fn parser_aborts_become_format_errors() {
        // Silence the default panic printout; the panic is expected here.
        let prev_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));

        let err = make(Params {
            target: target(),
            kernel_dirs: dirs(),
            split_build_delimiters: vec![],
            modules: vec![main_module()],
            readers: AbortingReaders,
        })
        .unwrap_err();

        std::panic::set_hook(prev_hook);

        // The payload itself is swallowed by the thread scope; what must
        // survive is the error kind and a message pointing at DWARF.
        assert!(matches!(err, Error::Format(_)));
        let msg = err.to_string();
        assert!(msg.contains("DWARF"), "{msg}");
    }

    #[test]
    fn assembly_is_deterministic() {
        let build = || {
            let mut readers = MockReaders::default();
            readers.modules.insert(String::new(), main_mock());
            make(Params {
                target: target(),
                kernel_dirs: dirs(),
                split_build_delimiters: vec![],
                modules: vec![main_module()],
                readers,
            })
            .unwrap()
        };

        let a = build();
        let b = build();
        assert_eq!(a.callback_points, b.callback_points);
        assert_eq!(a.symbols, b.symbols);
        assert_eq!(a.units.len(), b.units.len());
        for (ua, ub) in a.units.iter().zip(&b.units) {
            assert_eq!((&ua.name, &ua.path, &ua.pcs, &ua.cmps), (&ub.name, &ub.path, &ub.pcs, &ub.cmps));
        }
    }
}
