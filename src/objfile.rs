// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! High-level abstractions for working with large kernel object files.
//!
//! Kernel images and their debug info are big: a distro `vmlinux` with full
//! DWARF easily exceeds a gigabyte, and its debug sections are frequently
//! zlib- or zstd-compressed. The backing file is therefore `mmap`ed and
//! decompressed sections above a size threshold are spilled into anonymous
//! temporary files instead of being held in memory.

use crate::{AnyError, VirtAddr};

use std::io::Read as _;
use std::{fmt, fs, io, ops, path};

use flate2::read::ZlibDecoder;
use memmap2::{Mmap, MmapMut};
use object::{CompressionFormat, Object as _, ObjectSection as _};
use zstd::stream::read::Decoder as ZstdDecoder;

/// Maximum size of an individual object section to keep in memory.
///
/// All sections where the decompressed representation is larger than this
/// constant are instead read into anonymous temporary files and `mmap`ed.
const SWAP_THRESH: usize = 16 * 1024 * 1024;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur during object file parsing.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Sections are compressed in an unsupported format")]
    UnsupportedCompressionFormat,

    #[error("Section uses an unsupported relocation encoding")]
    UnsupportedRelocEncoding,

    #[error("Section uses an unsupported relocation kind")]
    UnsupportedRelocKind,

    #[error("Section uses an unsupported relocation target")]
    UnsupportedRelocTarget,

    #[error("Section uses an unsupported relocation size")]
    UnsupportedRelocSize,

    #[error("Relocation offset is out of bounds for the section")]
    OutOfBoundsRelocOffset,

    #[error("Relocation contains an invalid symbol index")]
    BadSymbolIndex,

    #[error("Relocation contains an invalid section index")]
    BadSectionIndex,

    #[error("Object file is too big to be loaded")]
    FileTooBig,

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error(transparent)]
    Other(AnyError),
}

/// Conversion of [`object`] errors into ours, with type erasure.
///
/// We erase the type here to prevent leaking [`object`] library types into our
/// public interface. If code needs to special-case based on particular
/// [`object`] errors, we should instead lift them into custom error variants.
impl From<object::Error> for Error {
    fn from(e: object::Error) -> Self {
        Self::Other(Box::new(e))
    }
}

/// Maps a kernel object file into memory.
///
/// This currently uses the [`object`] library to perform the actual heavy
/// lifting, however this should be considered an implementation detail.
pub struct File(Mmap);

impl File {
    /// Map the file at the given path into memory.
    pub fn load(path: &path::Path) -> Result<Self> {
        Self::load_file(&fs::File::open(path)?)
    }

    /// Map the given file into memory.
    pub fn load_file(file: &fs::File) -> Result<Self> {
        Ok(Self(unsafe { Mmap::map(file)? }))
    }

    /// Parse the header and create a reader.
    pub fn parse(&self) -> Result<Reader<'_>> {
        Ok(Reader(object::File::parse(&self.0[..])?))
    }
}

/// Provides read access to the data in an object file.
///
/// Created via [`File::parse`].
pub struct Reader<'obj>(object::File<'obj>);

impl<'obj> Reader<'obj> {
    /// Access to the underlying [`object`] file.
    ///
    /// Symbol- and relocation-table walks live in the [`crate::symbols`] and
    /// [`crate::elf`] modules and operate on the raw reader directly.
    pub(crate) fn raw(&self) -> &object::File<'obj> {
        &self.0
    }

    /// Loads the section with the given name into memory.
    ///
    /// Depending on whether the section is compressed in the input file or not,
    /// this can be an expensive operation. Callers should store and retrieve
    /// the returned instance if it is needed more than once.
    pub fn load_section(&self, name: &[u8]) -> Result<Option<Section<'obj>>> {
        let Some(obj_sec) = self.0.section_by_name_bytes(name) else {
            return Ok(None);
        };

        Section::load_from_obj_section(&obj_sec).map(Some)
    }

    /// Like [`Self::load_section`], but applies relocations if necessary.
    ///
    /// Loadable kernel modules are shipped as relocatable files whose DWARF
    /// sections carry unresolved cross-references; without applying the
    /// relocations, unit ranges and line programs decode to garbage. Only
    /// the basic relocation shapes seen on DWARF sections in the wild are
    /// supported.
    pub fn load_section_reloc(&self, name: &[u8]) -> Result<Option<Section<'obj>>> {
        let Some(obj_sec) = self.0.section_by_name_bytes(name) else {
            return Ok(None);
        };

        let mut section = Section::load_from_obj_section(&obj_sec)?;

        // Fully linked executables must not be relocated a second time:
        // some of them still carry (already applied) relocation records.
        if self.0.kind() == object::ObjectKind::Executable {
            return Ok(Some(section));
        }

        if obj_sec.relocations().next().is_none() {
            return Ok(Some(section));
        }

        // Make section data mutable so we can apply relocations.
        let section_data = section.data.make_mut()?;

        for (offset, reloc) in obj_sec.relocations() {
            if reloc.encoding() != object::RelocationEncoding::Generic {
                return Err(Error::UnsupportedRelocEncoding);
            }

            // `a`, `p` and `s` correspond to the same-named variables in the
            // `RelocationKind` documentation.
            let a = reloc.addend();

            let p = match reloc.kind() {
                object::RelocationKind::Absolute => 0,
                object::RelocationKind::Relative => section.virt_addr.wrapping_add(offset),
                _ => return Err(Error::UnsupportedRelocKind),
            };

            let s = match reloc.target() {
                object::RelocationTarget::Absolute => 0,

                object::RelocationTarget::Symbol(sym_idx) => {
                    use object::ObjectSymbol as _;
                    let Ok(refd_sym) = self.0.symbol_by_index(sym_idx) else {
                        return Err(Error::BadSymbolIndex);
                    };

                    refd_sym.address()
                }

                object::RelocationTarget::Section(sec_idx) => {
                    let Ok(refd_sec) = self.0.section_by_index(sec_idx) else {
                        return Err(Error::BadSectionIndex);
                    };

                    refd_sec.address()
                }

                _ => return Err(Error::UnsupportedRelocTarget),
            };

            let reloc_byte_size = (usize::from(reloc.size()) + 7) / 8;

            let Ok(offset) = usize::try_from(offset) else {
                return Err(Error::OutOfBoundsRelocOffset);
            };

            if section_data.len().saturating_sub(offset) < reloc_byte_size {
                return Err(Error::OutOfBoundsRelocOffset);
            }

            let reloc_buf = &mut section_data[offset..offset + reloc_byte_size];

            // The implicit addend is the original value at the location being
            // relocated (`rel` style sections; `rela` has explicit addends).
            let implicit_addend = match (reloc.has_implicit_addend(), reloc.size()) {
                (true, 32) => u32::from_le_bytes(reloc_buf.try_into().unwrap()) as u64,
                (true, 64) => u64::from_le_bytes(reloc_buf.try_into().unwrap()),
                (true, _) => return Err(Error::UnsupportedRelocSize),
                (false, _) => 0,
            };

            let relocated = implicit_addend
                .wrapping_add(s)
                .wrapping_add_signed(a)
                .wrapping_sub(p);

            match reloc.size() {
                32 => reloc_buf.copy_from_slice(&(relocated as u32).to_le_bytes()),
                64 => reloc_buf.copy_from_slice(&relocated.to_le_bytes()),
                _ => return Err(Error::UnsupportedRelocSize),
            }
        }

        Ok(Some(section))
    }

    /// Checks whether this file has little-endian byte-order.
    pub fn is_little_endian(&self) -> bool {
        self.0.is_little_endian()
    }
}

/// Information and raw data of an object file section.
#[derive(Debug)]
pub struct Section<'obj> {
    virt_addr: VirtAddr,
    virt_size: u64,
    data: SectionData<'obj>,
}

impl<'obj> Section<'obj> {
    /// Construction from an [`object::Section`].
    fn load_from_obj_section(obj_sec: &object::Section<'obj, '_>) -> Result<Self> {
        Ok(Section {
            virt_addr: obj_sec.address(),
            virt_size: obj_sec.size(),
            data: SectionData::load_from_obj_sec(obj_sec)?,
        })
    }

    /// Returns the virtual address of the first byte of this section.
    pub fn virt_addr(&self) -> VirtAddr {
        self.virt_addr
    }

    /// Returns the virtual size of the section.
    ///
    /// Can be larger than the actual data, padding must be assumed to be zeroed.
    pub fn virt_size(&self) -> u64 {
        self.virt_size
    }
}

/// Allow using section objects where slices are expected.
impl<'obj> ops::Deref for Section<'obj> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match &self.data {
            SectionData::Borrowed(x) => x,
            SectionData::InMemory(x) => &x[..],
            SectionData::Swapped(x) => &x[..],
        }
    }
}

/// Storage for object file sections.
pub enum SectionData<'obj> {
    /// Section was uncompressed in the input file and we simply kept a ref.
    Borrowed(&'obj [u8]),

    /// Section was originally compressed and we decompressed it into memory.
    InMemory(Vec<u8>),

    /// Section was originally compressed and we decompressed it into a
    /// memory-mapped temporary file.
    Swapped(MmapMut),
}

impl<'obj> SectionData<'obj> {
    /// Create [`Self::InMemory`] variant from a reader.
    fn read_into_memory(final_size: usize, mut reader: impl io::Read) -> Result<Self> {
        let mut mem_buf = Vec::with_capacity(final_size);
        reader.read_to_end(&mut mem_buf)?;
        Ok(SectionData::InMemory(mem_buf))
    }

    /// Create [`Self::Swapped`] variant from a reader.
    fn read_into_swap(mut reader: impl io::Read) -> Result<Self> {
        let mut file = tempfile::tempfile()?;
        io::copy(&mut reader, &mut file)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(SectionData::Swapped(mmap))
    }

    /// Creates a variant of the [`SectionData`] enum most appropriate for the
    /// given size.
    fn read_smart(final_size: usize, reader: impl io::Read) -> Result<Self> {
        if final_size >= SWAP_THRESH {
            Self::read_into_swap(reader)
        } else {
            Self::read_into_memory(final_size, reader)
        }
    }

    /// Load the data from the given [`object::Section`].
    fn load_from_obj_sec(sec: &object::Section<'obj, '_>) -> Result<Self> {
        let data = sec.compressed_data()?;

        // Ensure that the section fits into the address space.
        let final_size: usize = data
            .uncompressed_size
            .try_into()
            .map_err(|_| Error::FileTooBig)?;

        let decoder: Box<dyn io::Read> = match data.format {
            CompressionFormat::Zlib => Box::new(ZlibDecoder::new(data.data)),
            CompressionFormat::Zstandard => Box::new(ZstdDecoder::new(data.data)?),
            CompressionFormat::None => return Ok(SectionData::Borrowed(data.data)),
            _ => return Err(Error::UnsupportedCompressionFormat),
        };

        // Still here? Compressed section: unpack it.
        let decoder = decoder.take(final_size as u64);
        Self::read_smart(final_size, decoder)
    }

    /// Builds a mutable reference to the section's data (CoW semantics).
    ///
    /// If the data was previously borrowed, the first call will force a copy;
    /// all consecutive calls will re-use the same buffer.
    pub fn make_mut(&mut self) -> Result<&mut [u8]> {
        let borrowed = match self {
            // Fast paths: underlying buffer is writable already.
            SectionData::InMemory(x) => return Ok(&mut x[..]),
            SectionData::Swapped(x) => return Ok(&mut x[..]),

            // Expensive case: we need to copy.
            SectionData::Borrowed(x) => x,
        };

        *self = Self::read_smart(borrowed.len(), borrowed)?;

        self.make_mut()
    }
}

impl<'obj> fmt::Debug for SectionData<'obj> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (storage, len) = match self {
            Self::Borrowed(x) => ("borrowed", x.len()),
            Self::InMemory(x) => ("in-memory", x.len()),
            Self::Swapped(x) => ("mmapped", x.len()),
        };

        write!(f, "SectionData([{} bytes, {}])", len, storage)
    }
}
