use std::collections::HashMap;

use anyhow::{Context, Result};
use goblin::elf::dynamic::{DT_NEEDED, DT_RPATH, DT_RUNPATH, DT_SONAME};
use goblin::elf::Elf;

const SHN_UNDEF: usize = 0;
const STB_WEAK: u8 = 2;
const VER_NDX_GLOBAL: u16 = 1;
const VERSYM_HIDDEN: u16 = 0x8000;
const VERSYM_VERSION: u16 = 0x7fff;
const NT_GNU_BUILD_ID: u32 = 3;

/// An exported dynamic symbol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElfSymbolDefinition {
    pub name: String,
    pub version: Option<String>,
    /// True for the `foo@@V1` form that the link editor binds by default.
    pub default_version: bool,
    pub value: u64,
    pub section: u32,
    pub binding: u8,
    pub symbol_type: u8,
    pub visibility: u8,
    pub other: u8,
}

/// An undefined dynamic symbol that must be supplied by a dependency.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElfSymbolReference {
    pub name: String,
    pub version: Option<String>,
    pub weak: bool,
}

/// Dynamic section string entries, in encounter order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DynamicEntry {
    Needed(String),
    Soname(String),
    Rpath(String),
    Runpath(String),
}

#[derive(Debug)]
pub struct ElfImage {
    pub ei_class: u8,
    pub ei_data: u8,
    pub e_type: u16,
    pub e_machine: u16,
    pub arch: Option<&'static str>,
    pub build_id: Option<Vec<u8>>,
    pub definitions: Vec<ElfSymbolDefinition>,
    pub references: Vec<ElfSymbolReference>,
    pub dynamic: Vec<DynamicEntry>,
}

pub fn is_elf(data: &[u8]) -> bool {
    data.len() > 4 && data[0] == 0x7f && data[1] == b'E' && data[2] == b'L' && data[3] == b'F'
}

/// Architecture label derived from the header, using RPM-like names.
/// Returns `None` for machines outside the mapping.
pub fn arch_name(ei_class: u8, ei_data: u8, e_machine: u16) -> Option<&'static str> {
    use goblin::elf::header::*;
    let r = match e_machine {
        EM_386 => "i386",
        EM_X86_64 => "x86_64",
        EM_ARM => "arm",
        EM_AARCH64 => "aarch64",
        EM_PPC => "ppc",
        EM_PPC64 => {
            if ei_data == ELFDATA2LSB {
                "ppc64le"
            } else {
                "ppc64"
            }
        }
        EM_S390 => {
            if ei_class == ELFCLASS64 {
                "s390x"
            } else {
                "s390"
            }
        }
        EM_SPARC => "sparc",
        EM_SPARCV9 => "sparc64",
        EM_IA_64 => "ia64",
        EM_MIPS => "mips",
        EM_RISCV => {
            if ei_class == ELFCLASS64 {
                "riscv64"
            } else {
                "riscv32"
            }
        }
        _ => return None,
    };
    Some(r)
}

impl ElfImage {
    /// Analyzes an in-memory ELF image. Failures are reported to the
    /// caller as errors; per-file error rows are the caller's business.
    pub fn parse(data: &[u8]) -> Result<ElfImage> {
        let elf = Elf::parse(data).context("malformed ELF image")?;
        let ei_class = elf.header.e_ident[4];
        let ei_data = elf.header.e_ident[5];

        let mut image = ElfImage {
            ei_class,
            ei_data,
            e_type: elf.header.e_type,
            e_machine: elf.header.e_machine,
            arch: arch_name(ei_class, ei_data, elf.header.e_machine),
            build_id: find_build_id(&elf, data),
            definitions: Vec::new(),
            references: Vec::new(),
            dynamic: Vec::new(),
        };
        image.collect_symbols(&elf);
        image.collect_dynamic(&elf);
        Ok(image)
    }

    fn collect_symbols(&mut self, elf: &Elf) {
        // Map version indexes to version names, definitions from verdef
        // and references from verneed.
        let mut def_versions: HashMap<u16, String> = HashMap::new();
        if let Some(verdef) = &elf.verdef {
            for def in verdef.iter() {
                if let Some(aux) = def.iter().next() {
                    if let Some(name) = elf.dynstrtab.get_at(aux.vda_name) {
                        def_versions.insert(def.vd_ndx & VERSYM_VERSION, name.to_owned());
                    }
                }
            }
        }
        let mut need_versions: HashMap<u16, String> = HashMap::new();
        if let Some(verneed) = &elf.verneed {
            for need in verneed.iter() {
                for aux in need.iter() {
                    if let Some(name) = elf.dynstrtab.get_at(aux.vna_name) {
                        need_versions.insert(aux.vna_other & VERSYM_VERSION, name.to_owned());
                    }
                }
            }
        }

        for (index, sym) in elf.dynsyms.iter().enumerate() {
            if index == 0 {
                continue;
            }
            let name = match elf.dynstrtab.get_at(sym.st_name) {
                Some(name) if !name.is_empty() => name.to_owned(),
                _ => continue,
            };
            let versym = elf
                .versym
                .as_ref()
                .and_then(|v| v.get_at(index))
                .map(|v| v.vs_val);
            let version_index = versym.map(|v| v & VERSYM_VERSION);
            let hidden = versym.map(|v| v & VERSYM_HIDDEN != 0).unwrap_or(false);

            if sym.st_shndx == SHN_UNDEF {
                let version = version_index
                    .filter(|ndx| *ndx > VER_NDX_GLOBAL)
                    .and_then(|ndx| need_versions.get(&ndx))
                    .cloned();
                self.references.push(ElfSymbolReference {
                    name,
                    version,
                    weak: sym.st_bind() == STB_WEAK,
                });
            } else {
                let version = version_index
                    .filter(|ndx| *ndx > VER_NDX_GLOBAL)
                    .and_then(|ndx| def_versions.get(&ndx))
                    .cloned();
                let default_version = version.is_some() && !hidden;
                self.definitions.push(ElfSymbolDefinition {
                    name,
                    version,
                    default_version,
                    value: sym.st_value,
                    section: sym.st_shndx as u32,
                    binding: sym.st_bind(),
                    symbol_type: sym.st_type(),
                    visibility: sym.st_other & 0x3,
                    other: sym.st_other,
                });
            }
        }
    }

    fn collect_dynamic(&mut self, elf: &Elf) {
        let dynamic = match &elf.dynamic {
            Some(v) => v,
            None => return,
        };
        for dyn_entry in &dynamic.dyns {
            let value = || {
                elf.dynstrtab
                    .get_at(dyn_entry.d_val as usize)
                    .map(|s| s.to_owned())
            };
            let entry = match dyn_entry.d_tag {
                DT_NEEDED => value().map(DynamicEntry::Needed),
                DT_SONAME => value().map(DynamicEntry::Soname),
                DT_RPATH => value().map(DynamicEntry::Rpath),
                DT_RUNPATH => value().map(DynamicEntry::Runpath),
                _ => None,
            };
            if let Some(entry) = entry {
                self.dynamic.push(entry);
            }
        }
    }

    /// First stored soname, if any.
    pub fn soname(&self) -> Option<&str> {
        self.dynamic.iter().find_map(|entry| match entry {
            DynamicEntry::Soname(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

fn find_build_id(elf: &Elf, data: &[u8]) -> Option<Vec<u8>> {
    for note in elf.iter_note_headers(data)? {
        if let Ok(note) = note {
            if note.name == "GNU" && note.n_type == NT_GNU_BUILD_ID {
                return Some(note.desc.to_vec());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use goblin::elf::header::{ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFDATA2MSB, EM_386, EM_PPC64, EM_S390, EM_X86_64};

    #[test]
    fn test_is_elf() {
        assert!(is_elf(b"\x7fELF\x02\x01\x01"));
        assert!(!is_elf(b"\x7fELF"));
        assert!(!is_elf(b"#!/bin/sh\n"));
    }

    #[test]
    fn test_arch_names() {
        assert_eq!(arch_name(ELFCLASS64, ELFDATA2LSB, EM_X86_64), Some("x86_64"));
        assert_eq!(arch_name(ELFCLASS32, ELFDATA2LSB, EM_386), Some("i386"));
        assert_eq!(arch_name(ELFCLASS64, ELFDATA2MSB, EM_PPC64), Some("ppc64"));
        assert_eq!(arch_name(ELFCLASS64, ELFDATA2LSB, EM_PPC64), Some("ppc64le"));
        assert_eq!(arch_name(ELFCLASS64, ELFDATA2MSB, EM_S390), Some("s390x"));
        assert_eq!(arch_name(ELFCLASS64, ELFDATA2LSB, 0x1234), None);
    }

    #[test]
    fn test_truncated_image_is_an_error() {
        assert!(ElfImage::parse(b"\x7fELF\x02\x01\x01\x00garbage").is_err());
    }
}
