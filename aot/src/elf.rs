// elf.rs - ELF image loading for RISC-V executables
//
// Uses goblin for parsing, validates the image and extracts its loadable
// segments into a `LoadedImage`.

use crate::error::LoadError;
use goblin::elf::{header, program_header, Elf};
use tracing::debug;

/// Read/write/execute permissions of a loadable segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentFlags {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl SegmentFlags {
    fn from_p_flags(flags: u32) -> Self {
        Self {
            read: flags & program_header::PF_R != 0,
            write: flags & program_header::PF_W != 0,
            execute: flags & program_header::PF_X != 0,
        }
    }
}

/// A loadable segment with its file-backed bytes
#[derive(Debug, Clone)]
pub struct Segment {
    pub vaddr: u64,
    pub data: Vec<u8>,
    pub memsz: u64,
    pub flags: SegmentFlags,
}

impl Segment {
    /// End of the file-backed bytes (where decodable code stops)
    pub fn data_end(&self) -> u64 {
        self.vaddr + self.data.len() as u64
    }

    /// End of the segment once zero-filled to its memory size
    pub fn mem_end(&self) -> u64 {
        self.vaddr + self.memsz.max(self.data.len() as u64)
    }

    pub fn contains_code(&self, addr: u64) -> bool {
        self.flags.execute && addr >= self.vaddr && addr < self.data_end()
    }
}

/// A validated executable, ready for decoding
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub entry: u64,
    pub segments: Vec<Segment>,
    pub machine: u16,
    pub elf_type: u16,
    pub is_pie: bool,
    pub requires_dynamic_linking: bool,
    pub interpreter: Option<String>,
    pub phdr_vaddr: u64,
    pub phdr_count: u16,
}

/// Parse and validate a RISC-V ELF64 executable
pub fn load(data: &[u8]) -> Result<LoadedImage, LoadError> {
    let elf = Elf::parse(data)?;

    if !elf.is_64 {
        return Err(LoadError::Not64Bit);
    }
    if !elf.little_endian {
        return Err(LoadError::BigEndian);
    }
    if elf.header.e_machine != header::EM_RISCV {
        return Err(LoadError::WrongArchitecture(elf.header.e_machine));
    }
    let elf_type = elf.header.e_type;
    if elf_type != header::ET_EXEC && elf_type != header::ET_DYN {
        return Err(LoadError::UnsupportedType(elf_type));
    }

    let mut segments = Vec::new();
    for ph in elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == program_header::PT_LOAD)
    {
        let bytes = ph
            .p_offset
            .checked_add(ph.p_filesz)
            .filter(|&end| end <= data.len() as u64)
            .map(|end| &data[ph.p_offset as usize..end as usize])
            .ok_or(LoadError::TruncatedSegment { vaddr: ph.p_vaddr })?;

        segments.push(Segment {
            vaddr: ph.p_vaddr,
            data: bytes.to_vec(),
            memsz: ph.p_memsz,
            flags: SegmentFlags::from_p_flags(ph.p_flags),
        });
    }

    let phdr_vaddr = elf
        .program_headers
        .iter()
        .find(|ph| ph.p_type == program_header::PT_PHDR)
        .map(|ph| ph.p_vaddr)
        .unwrap_or(0);

    let interpreter = elf.interpreter.map(str::to_string);

    let image = LoadedImage {
        entry: elf.entry,
        segments,
        machine: elf.header.e_machine,
        elf_type,
        is_pie: elf_type == header::ET_DYN,
        requires_dynamic_linking: interpreter.is_some(),
        interpreter,
        phdr_vaddr,
        phdr_count: elf.header.e_phnum,
    };
    image.validate_code()?;

    debug!(
        entry = format_args!("0x{:x}", image.entry),
        segments = image.segments.len(),
        pie = image.is_pie,
        dynamic = image.requires_dynamic_linking,
        "loaded ELF image"
    );
    Ok(image)
}

impl LoadedImage {
    /// Build an image from a raw code region, as used for region compilation
    pub fn from_raw(code: &[u8], base: u64) -> Result<Self, LoadError> {
        let image = LoadedImage {
            entry: base,
            segments: vec![Segment {
                vaddr: base,
                data: code.to_vec(),
                memsz: code.len() as u64,
                flags: SegmentFlags {
                    read: true,
                    write: false,
                    execute: true,
                },
            }],
            machine: header::EM_RISCV,
            elf_type: header::ET_EXEC,
            is_pie: false,
            requires_dynamic_linking: false,
            interpreter: None,
            phdr_vaddr: 0,
            phdr_count: 0,
        };
        image.validate_code()?;
        Ok(image)
    }

    fn validate_code(&self) -> Result<(), LoadError> {
        // Segment ends are computed unchecked from here on
        if let Some(seg) = self.segments.iter().find(|seg| {
            seg.vaddr
                .checked_add(seg.memsz.max(seg.data.len() as u64))
                .is_none()
        }) {
            return Err(LoadError::AddressOverflow { vaddr: seg.vaddr });
        }
        if !self
            .executable_segments()
            .any(|seg| !seg.data.is_empty())
        {
            return Err(LoadError::NoCode);
        }
        if self.segment_containing(self.entry).is_none() {
            return Err(LoadError::EntryOutsideCode(self.entry));
        }
        Ok(())
    }

    /// Refuse images that need a runtime dynamic linker
    pub fn ensure_static(&self) -> Result<(), LoadError> {
        if self.requires_dynamic_linking {
            return Err(LoadError::DynamicLinking {
                interpreter: self
                    .interpreter
                    .clone()
                    .unwrap_or_else(|| "<unknown>".to_string()),
            });
        }
        Ok(())
    }

    /// Every loadable segment must fit inside the guest RAM window
    pub fn ensure_fits(&self, ram_size: u64) -> Result<(), LoadError> {
        for seg in &self.segments {
            let end = seg.mem_end();
            if end > ram_size {
                return Err(LoadError::SegmentOutsideRam {
                    vaddr: seg.vaddr,
                    end,
                    ram_size,
                });
            }
        }
        Ok(())
    }

    pub fn executable_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|seg| seg.flags.execute)
    }

    /// Executable segment whose file bytes contain `addr`
    pub fn segment_containing(&self, addr: u64) -> Option<&Segment> {
        self.segments.iter().find(|seg| seg.contains_code(addr))
    }

    /// `[min, max)` over all executable bytes, widened to 2-byte granules
    pub fn code_range(&self) -> (u64, u64) {
        let min = self
            .executable_segments()
            .map(|seg| seg.vaddr)
            .min()
            .unwrap_or(0);
        let max = self
            .executable_segments()
            .map(Segment::data_end)
            .max()
            .unwrap_or(0);
        (min & !1, max.saturating_add(1) & !1)
    }
}
