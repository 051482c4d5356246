//! Input classification and relocatable ELF parsing.
//!
//! Mapped input buffers are split into ELF relocatables and ar archives by
//! magic bytes. Each relocatable is validated and indexed without copying:
//! an [`ElfInput`] is a read-only view over one buffer's section headers and
//! section-name string table.

use object::elf;
use object::pod;
use object::LittleEndian;
use rayon::prelude::*;

use crate::error::{ErrorKind, LinkError, Result};
use crate::utils::cstr_at;

/// The seven identification bytes shared by every acceptable relocatable:
/// magic, 64-bit class, little-endian data, current version.
pub const ELF_IDENT: [u8; 7] = [
    0x7f,
    b'E',
    b'L',
    b'F',
    elf::ELFCLASS64,
    elf::ELFDATA2LSB,
    elf::EV_CURRENT,
];

/// Magic string opening a BSD/SysV `ar` archive.
pub const ARCHIVE_MAGIC: &[u8; 8] = b"!<arch>\n";

/// A 64-bit total order over inputs: `(file index : 32, sub index : 32)`.
///
/// Ordinary files use sub index zero; archive members use their byte offset
/// within the archive. "First occurrence" semantics for symbol resolution
/// and section concatenation are comparisons of this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey(u64);

impl SortKey {
    pub fn new(file_index: u32, sub_index: u32) -> Self {
        Self((u64::from(file_index) << 32) | u64::from(sub_index))
    }

    pub fn file_index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn sub_index(self) -> u32 {
        self.0 as u32
    }
}

/// Identifies one section of one ELF input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRef {
    pub elf_index: usize,
    pub header_index: usize,
}

/// Input buffers split by magic, original order preserved within each class.
pub struct ClassifiedInputs {
    pub elf_files: Vec<u32>,
    pub archives: Vec<u32>,
}

/// Splits mapped buffers into ELF relocatables and archives.
pub fn classify_inputs(buffers: &[&[u8]]) -> Result<ClassifiedInputs> {
    let mut classified = ClassifiedInputs { elf_files: Vec::new(), archives: Vec::new() };
    let mut status = crate::error::FirstError::default();

    for (file_index, buffer) in buffers.iter().enumerate() {
        if buffer.len() < std::mem::size_of::<elf::FileHeader64<LittleEndian>>() {
            status.record(LinkError::report(
                ErrorKind::BadInputFile,
                format!("input file #{file_index} is too small"),
            ));
            continue;
        }
        if buffer.starts_with(&ELF_IDENT) {
            classified.elf_files.push(file_index as u32);
        } else if buffer.starts_with(ARCHIVE_MAGIC) {
            classified.archives.push(file_index as u32);
        } else {
            status.record(LinkError::report(
                ErrorKind::BadInputFile,
                format!("input file #{file_index} is neither an archive nor an ELF file"),
            ));
        }
    }

    status.into_result()?;
    Ok(classified)
}

/// A validated relocatable ELF input. Holds only views into the mapped file.
#[derive(Clone, Copy)]
pub struct ElfInput<'data> {
    pub data: &'data [u8],
    pub shdrs: &'data [elf::SectionHeader64<LittleEndian>],
    shstrtab: &'data [u8],
}

impl<'data> ElfInput<'data> {
    /// Validates an ELF64/x86_64 relocatable and indexes its section headers.
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let e = LittleEndian;
        let (header, _) = pod::from_bytes::<elf::FileHeader64<LittleEndian>>(data)
            .map_err(|()| LinkError::report(ErrorKind::BadInputFile, "truncated ELF header"))?;

        if header.e_type.get(e) != elf::ET_REL {
            return Err(LinkError::report(ErrorKind::NotOk, "ELF file is not relocatable"));
        }
        if header.e_machine.get(e) != elf::EM_X86_64 {
            return Err(LinkError::report(ErrorKind::NotOk, "ELF file is not for x86_64"));
        }
        let shentsize = std::mem::size_of::<elf::SectionHeader64<LittleEndian>>();
        if usize::from(header.e_shentsize.get(e)) != shentsize {
            return Err(LinkError::report(
                ErrorKind::NotOk,
                "ELF file does not use the 64-bit section header format",
            ));
        }

        let shnum = usize::from(header.e_shnum.get(e));
        if shnum == 0 || shnum >= elf::SHN_LORESERVE as usize {
            return Err(LinkError::report(
                ErrorKind::BadInputFile,
                "ELF file with zero or too many sections",
            ));
        }
        let shstrndx = header.e_shstrndx.get(e);
        if shstrndx == elf::SHN_XINDEX || usize::from(shstrndx) >= shnum {
            return Err(LinkError::report(
                ErrorKind::BadInputFile,
                "ELF file with an out-of-range section name table index",
            ));
        }

        let shoff = header.e_shoff.get(e) as usize;
        match shoff.checked_add(shnum * shentsize) {
            Some(end) if end <= data.len() => {}
            _ => {
                return Err(LinkError::report(
                    ErrorKind::BadInputFile,
                    "section header table out of bounds",
                ))
            }
        }
        let (shdrs, _) =
            pod::slice_from_bytes::<elf::SectionHeader64<LittleEndian>>(&data[shoff..], shnum)
                .map_err(|()| {
                    LinkError::report(ErrorKind::BadInputFile, "misaligned section header table")
                })?;

        // Every section body must stay inside the mapped region; NOBITS has
        // no body. Group sections are not supported at all.
        for shdr in shdrs {
            if shdr.sh_type.get(e) == elf::SHT_GROUP {
                return Err(LinkError::report(ErrorKind::NotOk, "group sections not supported"));
            }
            if shdr.sh_type.get(e) == elf::SHT_NOBITS {
                continue;
            }
            let end = shdr.sh_offset.get(e).checked_add(shdr.sh_size.get(e));
            if end.is_none() || end.unwrap() > data.len() as u64 {
                return Err(LinkError::report(
                    ErrorKind::BadInputFile,
                    "ELF section data out of bounds",
                ));
            }
        }

        let strtab_hdr = &shdrs[usize::from(shstrndx)];
        let shstrtab = &data[strtab_hdr.sh_offset.get(e) as usize..]
            [..strtab_hdr.sh_size.get(e) as usize];

        Ok(Self { data, shdrs, shstrtab })
    }

    /// The section's name, read from the section-name string table.
    pub fn section_name(&self, shdr: &elf::SectionHeader64<LittleEndian>) -> Result<&'data [u8]> {
        cstr_at(self.shstrtab, shdr.sh_name.get(LittleEndian) as usize)
    }

    /// The section's body bytes. NOBITS sections have no body.
    pub fn section_data(&self, shdr: &elf::SectionHeader64<LittleEndian>) -> &'data [u8] {
        let e = LittleEndian;
        if shdr.sh_type.get(e) == elf::SHT_NOBITS {
            return &[];
        }
        &self.data[shdr.sh_offset.get(e) as usize..][..shdr.sh_size.get(e) as usize]
    }

    /// The symbol records of a SYMTAB section.
    pub fn symbols(
        &self,
        shdr: &elf::SectionHeader64<LittleEndian>,
    ) -> Result<&'data [elf::Sym64<LittleEndian>]> {
        let e = LittleEndian;
        let entsize = std::mem::size_of::<elf::Sym64<LittleEndian>>() as u64;
        if shdr.sh_entsize.get(e) != entsize {
            return Err(LinkError::report(
                ErrorKind::BadInputFile,
                "symbol table entries are not of the 64-bit format",
            ));
        }
        let count = (shdr.sh_size.get(e) / entsize) as usize;
        let offset = shdr.sh_offset.get(e) as usize;
        let (symbols, _) =
            pod::slice_from_bytes::<elf::Sym64<LittleEndian>>(&self.data[offset..], count)
                .map_err(|()| {
                    LinkError::report(ErrorKind::BadInputFile, "misaligned symbol table")
                })?;
        Ok(symbols)
    }

    /// The string table a SYMTAB or RELA section links to via `sh_link`.
    pub fn linked_section(
        &self,
        shdr: &elf::SectionHeader64<LittleEndian>,
    ) -> Result<&'data elf::SectionHeader64<LittleEndian>> {
        let link = shdr.sh_link.get(LittleEndian) as usize;
        self.shdrs.get(link).ok_or_else(|| {
            LinkError::report(ErrorKind::BadInputFile, "section link index out of range")
        })
    }
}

/// Parses all eager ELF inputs, one parallel task per input.
pub fn parse_elf_inputs<'data>(
    buffers: &[&'data [u8]],
    elf_file_indices: &[u32],
) -> Result<(Vec<ElfInput<'data>>, Vec<SortKey>)> {
    let parsed: Vec<Result<ElfInput<'data>>> = elf_file_indices
        .par_iter()
        .map(|&file_index| ElfInput::parse(buffers[file_index as usize]))
        .collect();

    let mut inputs = Vec::with_capacity(parsed.len());
    for result in parsed {
        inputs.push(result?);
    }
    let sort_keys = elf_file_indices.iter().map(|&i| SortKey::new(i, 0)).collect();
    Ok((inputs, sort_keys))
}
