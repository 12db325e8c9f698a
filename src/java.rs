use std::io::Read;

use anyhow::{bail, Result};

// Constant pool tags.
const CONSTANT_UTF8: u8 = 1;
const CONSTANT_INTEGER: u8 = 3;
const CONSTANT_FLOAT: u8 = 4;
const CONSTANT_LONG: u8 = 5;
const CONSTANT_DOUBLE: u8 = 6;
const CONSTANT_CLASS: u8 = 7;
const CONSTANT_STRING: u8 = 8;
const CONSTANT_FIELDREF: u8 = 9;
const CONSTANT_METHODREF: u8 = 10;
const CONSTANT_INTERFACE_METHODREF: u8 = 11;
const CONSTANT_NAME_AND_TYPE: u8 = 12;
const CONSTANT_METHOD_HANDLE: u8 = 15;
const CONSTANT_METHOD_TYPE: u8 = 16;
const CONSTANT_DYNAMIC: u8 = 17;
const CONSTANT_INVOKE_DYNAMIC: u8 = 18;
const CONSTANT_MODULE: u8 = 19;
const CONSTANT_PACKAGE: u8 = 20;

const CLASS_MAGIC: u32 = 0xCAFEBABE;

/// Returns true for plausible Java class files: the magic plus a sane
/// major version.
pub fn has_class_signature(data: &[u8]) -> bool {
    if data.len() < 32 {
        return false;
    }
    let magic = u32::from_be_bytes(data[0..4].try_into().unwrap());
    let major = u16::from_be_bytes(data[6..8].try_into().unwrap());
    magic == CLASS_MAGIC && major < 100
}

#[derive(Debug)]
pub struct JavaClass {
    pub access_flags: u16,
    pub this_class: String,
    /// Empty for java/lang/Object, whose super-class index is zero.
    pub super_class: String,
    pub interfaces: Vec<String>,
    /// All classes referenced anywhere in the constant pool, sorted.
    pub class_references: Vec<String>,
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.offset + len > self.data.len() {
            bail!("index out of range at {}", self.offset);
        }
        let r = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(r)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }
}

struct ConstantPool<'a> {
    data: &'a [u8],
    // Store offset of each pool entry; the second slot of longs and
    // doubles is zero.
    offsets: Vec<usize>,
}

impl<'a> ConstantPool<'a> {
    fn entry(&self, index: u16) -> Result<Cursor<'a>> {
        if index == 0 {
            bail!("zero constant pool index");
        }
        match self.offsets.get(index as usize - 1) {
            Some(&offset) if offset != 0 => Ok(Cursor {
                data: self.data,
                offset,
            }),
            _ => bail!("constant pool index {} out of range", index),
        }
    }

    fn utf8(&self, index: u16) -> Result<String> {
        let mut cursor = self.entry(index)?;
        if cursor.u8()? != CONSTANT_UTF8 {
            bail!("UTF-8 tag expected at constant pool index {}", index);
        }
        let len = cursor.u16()? as usize;
        let bytes = cursor.take(len)?;
        // Java's modified UTF-8 is close enough to UTF-8 for class
        // names; repair odd bytes via Latin-1 like other metadata.
        Ok(crate::rpm::decode_header_string(bytes))
    }

    fn class_name(&self, index: u16) -> Result<String> {
        let mut cursor = self.entry(index)?;
        if cursor.u8()? != CONSTANT_CLASS {
            bail!("class tag expected at constant pool index {}", index);
        }
        let name_index = cursor.u16()?;
        self.utf8(name_index)
    }
}

impl JavaClass {
    pub fn parse(data: &[u8]) -> Result<JavaClass> {
        let mut cursor = Cursor { data, offset: 0 };
        if cursor.u32()? != CLASS_MAGIC {
            bail!("class file magic value not found");
        }
        let _minor = cursor.u16()?;
        let _major = cursor.u16()?;

        let constant_pool_count = cursor.u16()?;
        let mut offsets = Vec::with_capacity(constant_pool_count.saturating_sub(1) as usize);
        let mut i = 1;
        while i < constant_pool_count {
            offsets.push(cursor.offset);
            let tag = cursor.u8()?;
            match tag {
                CONSTANT_CLASS | CONSTANT_STRING | CONSTANT_METHOD_TYPE | CONSTANT_MODULE
                | CONSTANT_PACKAGE => {
                    cursor.take(2)?;
                }
                CONSTANT_METHOD_HANDLE => {
                    cursor.take(3)?;
                }
                CONSTANT_FIELDREF
                | CONSTANT_METHODREF
                | CONSTANT_INTERFACE_METHODREF
                | CONSTANT_NAME_AND_TYPE
                | CONSTANT_INTEGER
                | CONSTANT_FLOAT
                | CONSTANT_DYNAMIC
                | CONSTANT_INVOKE_DYNAMIC => {
                    cursor.take(4)?;
                }
                CONSTANT_LONG | CONSTANT_DOUBLE => {
                    cursor.take(8)?;
                    // Longs and doubles take two slots.
                    offsets.push(0);
                    i += 1;
                }
                CONSTANT_UTF8 => {
                    let len = cursor.u16()? as usize;
                    cursor.take(len)?;
                }
                _ => bail!("invalid constant pool tag {}", tag),
            }
            i += 1;
        }
        let pool = ConstantPool { data, offsets };

        let access_flags = cursor.u16()?;
        let this_class = pool.class_name(cursor.u16()?)?;
        let super_index = cursor.u16()?;
        let super_class = if super_index == 0 {
            String::new()
        } else {
            pool.class_name(super_index)?
        };

        let interface_count = cursor.u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(pool.class_name(cursor.u16()?)?);
        }

        let mut class_references = Vec::new();
        for &offset in &pool.offsets {
            if offset != 0 && data[offset] == CONSTANT_CLASS {
                let mut cursor = Cursor { data, offset: offset + 1 };
                class_references.push(pool.utf8(cursor.u16()?)?);
            }
        }
        class_references.sort();
        class_references.dedup();

        let r = JavaClass {
            access_flags,
            this_class,
            super_class,
            interfaces,
            class_references,
        };
        Ok(r)
    }
}

pub fn has_zip_signature(data: &[u8]) -> bool {
    data.len() > 4 && data[0] == b'P' && data[1] == b'K' && data[2] == 3 && data[3] == 4
}

/// Per-member failure while scanning a jar.
#[derive(Debug)]
pub struct JarError {
    pub member: String,
    pub message: String,
}

/// Scans a zip archive for Java class members. Per-member failures are
/// collected; they never abort the archive.
pub fn scan_jar(data: &[u8]) -> (Vec<JavaClass>, Vec<JarError>) {
    let mut classes = Vec::new();
    let mut errors = Vec::new();
    let mut archive = match zip::ZipArchive::new(std::io::Cursor::new(data)) {
        Ok(v) => v,
        Err(err) => {
            errors.push(JarError {
                member: String::new(),
                message: err.to_string(),
            });
            return (classes, errors);
        }
    };
    for index in 0..archive.len() {
        let mut member = match archive.by_index(index) {
            Ok(v) => v,
            Err(err) => {
                errors.push(JarError {
                    member: String::new(),
                    message: err.to_string(),
                });
                continue;
            }
        };
        let name = member.name().to_owned();
        let mut contents = Vec::new();
        if let Err(err) = member.read_to_end(&mut contents) {
            errors.push(JarError {
                member: name,
                message: err.to_string(),
            });
            continue;
        }
        if !has_class_signature(&contents) {
            continue;
        }
        match JavaClass::parse(&contents) {
            Ok(class) => classes.push(class),
            Err(err) => errors.push(JarError {
                member: name,
                message: err.to_string(),
            }),
        }
    }
    (classes, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Hand-assembles a class "A" extending java/lang/Object and
    // referencing "B".
    pub(crate) fn sample_class() -> Vec<u8> {
        let mut pool: Vec<Vec<u8>> = Vec::new();
        let utf8 = |s: &str| {
            let mut e = vec![CONSTANT_UTF8];
            e.extend_from_slice(&(s.len() as u16).to_be_bytes());
            e.extend_from_slice(s.as_bytes());
            e
        };
        let class = |utf8_index: u16| {
            let mut e = vec![CONSTANT_CLASS];
            e.extend_from_slice(&utf8_index.to_be_bytes());
            e
        };
        pool.push(utf8("A")); // 1
        pool.push(class(1)); // 2
        pool.push(utf8("java/lang/Object")); // 3
        pool.push(class(3)); // 4
        pool.push(utf8("B")); // 5
        pool.push(class(5)); // 6

        let mut out = Vec::new();
        out.extend_from_slice(&CLASS_MAGIC.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // minor
        out.extend_from_slice(&52u16.to_be_bytes()); // major (Java 8)
        out.extend_from_slice(&(pool.len() as u16 + 1).to_be_bytes());
        for entry in &pool {
            out.extend_from_slice(entry);
        }
        out.extend_from_slice(&0x0021u16.to_be_bytes()); // access flags
        out.extend_from_slice(&2u16.to_be_bytes()); // this: A
        out.extend_from_slice(&4u16.to_be_bytes()); // super: Object
        out.extend_from_slice(&0u16.to_be_bytes()); // interfaces
        // Padding so the signature check's minimum length holds.
        out.extend_from_slice(&[0u8; 8]);
        out
    }

    #[test]
    fn test_parse_sample_class() {
        let data = sample_class();
        assert!(has_class_signature(&data));
        let class = JavaClass::parse(&data).unwrap();
        assert_eq!(class.this_class, "A");
        assert_eq!(class.super_class, "java/lang/Object");
        assert!(class.interfaces.is_empty());
        assert_eq!(class.class_references, vec!["A", "B", "java/lang/Object"]);
    }

    #[test]
    fn test_major_version_guard() {
        let mut data = sample_class();
        data[6..8].copy_from_slice(&100u16.to_be_bytes());
        assert!(!has_class_signature(&data));
    }

    #[test]
    fn test_truncated_pool() {
        let data = sample_class();
        let err = JavaClass::parse(&data[..12]).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{}", err);
    }

    #[test]
    fn test_scan_jar_mixed_members() {
        let mut zip_data = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_data));
            let options = zip::write::FileOptions::default();
            writer.start_file("A.class", options).unwrap();
            writer.write_all(&sample_class()).unwrap();
            writer.start_file("broken.class", options).unwrap();
            // Valid signature, truncated pool.
            writer.write_all(&sample_class()[..13]).unwrap();
            writer.write_all(&[0u8; 24]).unwrap();
            writer.start_file("README", options).unwrap();
            writer.write_all(b"not a class").unwrap();
            writer.finish().unwrap();
        }
        assert!(has_zip_signature(&zip_data));
        let (classes, errors) = scan_jar(&zip_data);
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].this_class, "A");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].member, "broken.class");
    }
}
