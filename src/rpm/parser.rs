use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::checksum::{Checksum, HashAlgorithm};
use crate::rpm::cpio;
use crate::rpm::header::*;
use crate::rpm::{
    DependencyKind, PackageKind, RpmDependency, RpmFileInfo, RpmPackageInfo, RpmScript,
    RpmTrigger, ScriptKind, TriggerCondition,
};

// RPMTAG_FILEDIGESTALGO values, from RFC 4880 hash identifiers.
const PGPHASHALGO_MD5: u32 = 1;
const PGPHASHALGO_SHA1: u32 = 2;
const PGPHASHALGO_SHA256: u32 = 8;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;

/// One file streamed out of the payload (or synthesized for a ghost).
#[derive(Clone, Debug)]
pub struct RpmFileEntry {
    pub info: RpmFileInfo,
    pub contents: Vec<u8>,
}

/// Streaming parser over one RPM file: header access first, then the
/// CPIO-packed payload entry by entry. After the CPIO trailer, one entry
/// per ghost file is synthesized with empty contents.
pub struct RpmParser {
    header: Header,
    info: RpmPackageInfo,
    dependencies: Vec<RpmDependency>,
    files: HashMap<String, RpmFileInfo>,
    ghosts: Vec<RpmFileInfo>,
    raw: Option<BufReader<File>>,
    payload: Option<Box<dyn Read>>,
    archive_entry_count: usize,
    reached_ghosts: bool,
    ghost_index: usize,
}

impl RpmParser {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("could not open RPM file {:?}", path))?;
        let mut reader = BufReader::new(file);
        read_lead(&mut reader)?;
        // The signature header is not verified here, but its geometry
        // must be consumed to reach the main header.
        let _signature = Header::read(&mut reader, true).context("RPM signature header")?;
        let header = Header::read(&mut reader, false).context("RPM header")?;

        let info = package_info(&header)?;
        let dependencies = package_dependencies(&header)?;
        let (files, ghosts) = files_from_header(&header)?;

        let r = Self {
            header,
            info,
            dependencies,
            files,
            ghosts,
            raw: Some(reader),
            payload: None,
            archive_entry_count: 0,
            reached_ghosts: false,
            ghost_index: 0,
        };
        Ok(r)
    }

    pub fn package(&self) -> &RpmPackageInfo {
        &self.info
    }

    pub fn nevra(&self) -> String {
        self.info.nevra()
    }

    pub fn dependencies(&self) -> &[RpmDependency] {
        &self.dependencies
    }

    /// Header file table, payload files first, then ghosts.
    pub fn file_infos(&self) -> Vec<RpmFileInfo> {
        let mut infos: Vec<_> = self
            .files
            .values()
            .filter(|info| !info.ghost())
            .cloned()
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos.extend(self.ghosts.iter().cloned());
        infos
    }

    pub fn scripts(&self) -> Vec<RpmScript> {
        const TAGS: [(ScriptKind, u32, u32); 7] = [
            (ScriptKind::Pretrans, RPMTAG_PRETRANS, RPMTAG_PRETRANSPROG),
            (ScriptKind::Prein, RPMTAG_PREIN, RPMTAG_PREINPROG),
            (ScriptKind::Postin, RPMTAG_POSTIN, RPMTAG_POSTINPROG),
            (ScriptKind::Preun, RPMTAG_PREUN, RPMTAG_PREUNPROG),
            (ScriptKind::Postun, RPMTAG_POSTUN, RPMTAG_POSTUNPROG),
            (ScriptKind::Posttrans, RPMTAG_POSTTRANS, RPMTAG_POSTTRANSPROG),
            (ScriptKind::Verify, RPMTAG_VERIFYSCRIPT, RPMTAG_VERIFYSCRIPTPROG),
        ];
        TAGS.iter()
            .map(|(kind, script_tag, prog_tag)| RpmScript {
                kind: *kind,
                script: self.header.opt_string(*script_tag),
                prog: string_or_array(&self.header, *prog_tag),
            })
            .collect()
    }

    pub fn triggers(&self) -> Result<Vec<RpmTrigger>> {
        let scripts = self.header.opt_string_array(RPMTAG_TRIGGERSCRIPTS);
        if scripts.is_empty() {
            return Ok(Vec::new());
        }
        let progs = self.header.string_array(RPMTAG_TRIGGERSCRIPTPROG)?;
        let names = self.header.string_array(RPMTAG_TRIGGERNAME)?;
        let versions = self.header.string_array(RPMTAG_TRIGGERVERSION)?;
        let flags = self.header.u32_array(RPMTAG_TRIGGERFLAGS)?;
        let indexes = self.header.u32_array(RPMTAG_TRIGGERINDEX)?;
        if progs.len() != scripts.len()
            || names.len() != versions.len()
            || names.len() != flags.len()
            || names.len() != indexes.len()
        {
            bail!("inconsistent trigger arrays in RPM header");
        }

        let mut triggers: Vec<RpmTrigger> = scripts
            .into_iter()
            .zip(progs)
            .map(|(script, prog)| RpmTrigger {
                script,
                prog,
                conditions: Vec::new(),
            })
            .collect();
        for i in 0..names.len() {
            let index = indexes[i] as usize;
            if index >= triggers.len() {
                bail!("trigger condition {} references script {}", i, index);
            }
            triggers[index].conditions.push(TriggerCondition {
                name: names[i].clone(),
                version: versions[i].clone(),
                flags: flags[i] as i32,
            });
        }
        Ok(triggers)
    }

    fn open_payload(&mut self) -> Result<()> {
        let raw = match self.raw.take() {
            Some(v) => v,
            None => bail!("RPM payload opened twice"),
        };
        let compressor = self
            .header
            .opt_string(RPMTAG_PAYLOADCOMPRESSOR)
            .unwrap_or_else(|| "gzip".to_owned());
        let payload: Box<dyn Read> = match compressor.as_str() {
            "gzip" => Box::new(flate2::read::GzDecoder::new(raw)),
            "bzip2" => Box::new(bzip2::read::BzDecoder::new(raw)),
            "xz" => Box::new(xz2::read::XzDecoder::new(raw)),
            "zstd" => Box::new(zstd::stream::read::Decoder::new(raw)?),
            _ => bail!("unsupported payload compressor {:?}", compressor),
        };
        self.payload = Some(payload);
        Ok(())
    }

    fn read_exact_payload(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        self.payload
            .as_mut()
            .unwrap()
            .read_exact(buf)
            .with_context(|| format!("end of stream in {}", what))
    }

    fn skip_padding(&mut self, position: usize, what: &str) -> Result<()> {
        let pad = (4 - position % 4) % 4;
        let mut scratch = [0u8; 4];
        if pad > 0 {
            self.read_exact_payload(&mut scratch[..pad], what)?;
        }
        Ok(())
    }

    fn read_file_ghost(&mut self) -> Option<RpmFileEntry> {
        if self.ghost_index == self.ghosts.len() {
            return None;
        }
        let info = self.ghosts[self.ghost_index].clone();
        self.ghost_index += 1;
        Some(RpmFileEntry {
            info,
            contents: Vec::new(),
        })
    }

    fn check_trailer(&self) -> Result<()> {
        let expected = self.files.values().filter(|info| !info.ghost()).count();
        if self.archive_entry_count != expected {
            bail!(
                "CPIO archive with {} entries instead of {}",
                self.archive_entry_count,
                expected
            );
        }
        Ok(())
    }

    /// Returns the next payload entry, or `None` after the last ghost.
    pub fn read_file(&mut self) -> Result<Option<RpmFileEntry>> {
        if self.payload.is_none() && !self.reached_ghosts {
            self.open_payload()?;
        }
        if self.reached_ghosts {
            return Ok(self.read_file_ghost());
        }

        let mut magic = [0u8; cpio::MAGIC_SIZE];
        self.read_exact_payload(&mut magic, "cpio file header")?;
        let header_len = cpio::header_length(&magic)?;
        let mut header_buf = vec![0u8; header_len];
        self.read_exact_payload(&mut header_buf, "cpio file header")?;
        let entry = cpio::parse(&header_buf)?;
        if entry.namesize == 0 {
            bail!("empty file name in cpio header");
        }

        let mut name_buf = vec![0u8; entry.namesize as usize];
        self.read_exact_payload(&mut name_buf, "cpio file name")?;
        self.skip_padding(
            cpio::MAGIC_SIZE + header_len + name_buf.len(),
            "cpio file name padding",
        )?;
        if name_buf.last() != Some(&0) {
            bail!("unterminated cpio file name");
        }
        name_buf.pop();
        let name = super::decode_header_string(&name_buf);

        if name == cpio::TRAILER {
            self.check_trailer()?;
            self.reached_ghosts = true;
            return Ok(self.read_file_ghost());
        }

        let name = name.strip_prefix("./").map(|s| format!("/{}", s)).unwrap_or(name);
        let info = match self.files.get(&name) {
            Some(info) => info.clone(),
            None => bail!("cpio file not found in RPM header: {}", name),
        };
        if !info.ghost() {
            self.archive_entry_count += 1;
        }

        let mut contents = vec![0u8; entry.filesize as usize];
        if entry.filesize > 0 {
            self.read_exact_payload(&mut contents, "cpio file contents")?;
        }
        self.skip_padding(entry.filesize as usize, "cpio file contents padding")?;

        Ok(Some(RpmFileEntry { info, contents }))
    }
}

fn string_or_array(header: &Header, tag: u32) -> Vec<String> {
    if !header.has(tag) {
        return Vec::new();
    }
    match header.string(tag) {
        Ok(s) => vec![s],
        Err(_) => header.string_array(tag).unwrap_or_default(),
    }
}

fn package_info(header: &Header) -> Result<RpmPackageInfo> {
    let epoch = match header.opt_u32(RPMTAG_EPOCH) {
        Some(v) if v > i32::MAX as u32 => bail!("RPM epoch out of range"),
        Some(v) => Some(v as i32),
        None => None,
    };
    let kind = if header.has(RPMTAG_SOURCEPACKAGE) {
        PackageKind::Source
    } else {
        PackageKind::Binary
    };
    let r = RpmPackageInfo {
        name: header.string(RPMTAG_NAME).context("NAME header")?,
        epoch,
        version: header.string(RPMTAG_VERSION).context("VERSION header")?,
        release: header.string(RPMTAG_RELEASE).context("RELEASE header")?,
        arch: header.string(RPMTAG_ARCH).context("ARCH header")?,
        source_rpm: header.opt_string(RPMTAG_SOURCERPM).unwrap_or_default(),
        build_time: header.u32(RPMTAG_BUILDTIME).context("BUILDTIME header")? as i64,
        build_host: header.string(RPMTAG_BUILDHOST).context("BUILDHOST header")?,
        summary: header.string(RPMTAG_SUMMARY).context("SUMMARY header")?,
        description: header.string(RPMTAG_DESCRIPTION).context("DESCRIPTION header")?,
        license: header.string(RPMTAG_LICENSE).context("LICENSE header")?,
        group: header.string(RPMTAG_GROUP).context("GROUP header")?,
        hash: header.string(RPMTAG_SHA1HEADER).context("SHA1HEADER header")?,
        kind,
    };
    Ok(r)
}

fn decode_deps(
    header: &Header,
    out: &mut Vec<RpmDependency>,
    kind: DependencyKind,
    optional: bool,
    name_tag: u32,
    flags_tag: u32,
    version_tag: u32,
) -> Result<()> {
    if optional && !header.has(name_tag) {
        return Ok(());
    }
    let names = header
        .string_array(name_tag)
        .with_context(|| format!("{} name header", kind.as_str()))?;
    let flags = header
        .u32_array(flags_tag)
        .with_context(|| format!("{} flags header", kind.as_str()))?;
    let versions = header
        .string_array(version_tag)
        .with_context(|| format!("{} version header", kind.as_str()))?;
    if names.len() != flags.len() || names.len() != versions.len() {
        bail!("inconsistent {} dependency arrays", kind.as_str());
    }
    for ((capability, flags), version) in names.into_iter().zip(flags).zip(versions) {
        let mut op = String::new();
        if flags & RPMSENSE_LESS != 0 {
            op.push('<');
        }
        if flags & RPMSENSE_GREATER != 0 {
            op.push('>');
        }
        if flags & RPMSENSE_EQUAL != 0 {
            op.push('=');
        }
        out.push(RpmDependency {
            kind,
            capability,
            op,
            version,
            pre: flags & RPMSENSE_PREREQ != 0,
        });
    }
    Ok(())
}

fn package_dependencies(header: &Header) -> Result<Vec<RpmDependency>> {
    let mut deps = Vec::new();
    decode_deps(
        header,
        &mut deps,
        DependencyKind::Requires,
        false,
        RPMTAG_REQUIRENAME,
        RPMTAG_REQUIREFLAGS,
        RPMTAG_REQUIREVERSION,
    )?;
    decode_deps(
        header,
        &mut deps,
        DependencyKind::Provides,
        true,
        RPMTAG_PROVIDENAME,
        RPMTAG_PROVIDEFLAGS,
        RPMTAG_PROVIDEVERSION,
    )?;
    decode_deps(
        header,
        &mut deps,
        DependencyKind::Obsoletes,
        true,
        RPMTAG_OBSOLETENAME,
        RPMTAG_OBSOLETEFLAGS,
        RPMTAG_OBSOLETEVERSION,
    )?;
    decode_deps(
        header,
        &mut deps,
        DependencyKind::Conflicts,
        true,
        RPMTAG_CONFLICTNAME,
        RPMTAG_CONFLICTFLAGS,
        RPMTAG_CONFLICTVERSION,
    )?;
    Ok(deps)
}

fn digest_algorithm(header: &Header) -> Result<HashAlgorithm> {
    let r = match header.opt_u32(RPMTAG_FILEDIGESTALGO) {
        None | Some(PGPHASHALGO_MD5) => HashAlgorithm::Md5,
        Some(PGPHASHALGO_SHA1) => HashAlgorithm::Sha1,
        Some(PGPHASHALGO_SHA256) => HashAlgorithm::Sha256,
        Some(other) => bail!("unknown file digest algorithm {}", other),
    };
    Ok(r)
}

type FileTable = (HashMap<String, RpmFileInfo>, Vec<RpmFileInfo>);

fn files_from_header(header: &Header) -> Result<FileTable> {
    let basenames = header.opt_string_array(RPMTAG_BASENAMES);
    if basenames.is_empty() {
        return Ok((HashMap::new(), Vec::new()));
    }
    let dirnames = header.string_array(RPMTAG_DIRNAMES).context("DIRNAMES")?;
    let dirindexes = header.u32_array(RPMTAG_DIRINDEXES).context("DIRINDEXES")?;
    let sizes = header.u32_array(RPMTAG_FILESIZES).context("FILESIZES")?;
    let modes = header.u16_array(RPMTAG_FILEMODES).context("FILEMODES")?;
    let mtimes = header.u32_array(RPMTAG_FILEMTIMES).context("FILEMTIMES")?;
    let digests = header.string_array(RPMTAG_FILEDIGESTS).context("FILEDIGESTS")?;
    let users = header.string_array(RPMTAG_FILEUSERNAME).context("FILEUSERNAME")?;
    let groups = header.string_array(RPMTAG_FILEGROUPNAME).context("FILEGROUPNAME")?;
    let inodes = header.u32_array(RPMTAG_FILEINODES).context("FILEINODES")?;
    let flags = header.u32_array(RPMTAG_FILEFLAGS).context("FILEFLAGS")?;
    let devices = if header.has(RPMTAG_FILEDEVICES) {
        header.u32_array(RPMTAG_FILEDEVICES)?
    } else {
        vec![0; basenames.len()]
    };

    let count = basenames.len();
    for (name, len) in [
        ("DIRINDEXES", dirindexes.len()),
        ("FILESIZES", sizes.len()),
        ("FILEMODES", modes.len()),
        ("FILEMTIMES", mtimes.len()),
        ("FILEDIGESTS", digests.len()),
        ("FILEUSERNAME", users.len()),
        ("FILEGROUPNAME", groups.len()),
        ("FILEINODES", inodes.len()),
        ("FILEFLAGS", flags.len()),
        ("FILEDEVICES", devices.len()),
    ] {
        if len != count {
            bail!("RPM header file array {} has {} entries instead of {}", name, len, count);
        }
    }

    let algorithm = digest_algorithm(header)?;

    // Link counts are not stored; they are the number of regular files
    // sharing a (device, inode) pair.
    let mut link_counts: HashMap<(u32, u32), u32> = HashMap::new();
    for i in 0..count {
        if u32::from(modes[i]) & S_IFMT == S_IFREG && inodes[i] != 0 {
            *link_counts.entry((devices[i], inodes[i])).or_insert(0) += 1;
        }
    }

    let mut files = HashMap::with_capacity(count);
    let mut ghosts = Vec::new();
    for i in 0..count {
        let dir = match dirnames.get(dirindexes[i] as usize) {
            Some(v) => v,
            None => bail!("DIRINDEXES entry {} out of range", i),
        };
        let name = format!("{}{}", dir, basenames[i]);
        let mode = u32::from(modes[i]);
        let ghost = flags[i] & super::RPMFILE_GHOST != 0;
        let digest = if ghost {
            // Ghost size and digest come from the build root, which is
            // no longer available.
            Checksum::empty_sha256()
        } else {
            Checksum {
                algorithm,
                value: hex::decode(&digests[i])
                    .with_context(|| format!("malformed file digest for {}", name))?,
                length: Some(u64::from(sizes[i])),
            }
        };
        let nlinks = if mode & S_IFMT == S_IFREG && inodes[i] != 0 {
            link_counts.get(&(devices[i], inodes[i])).copied().unwrap_or(1)
        } else {
            1
        };
        let info = RpmFileInfo {
            name: name.clone(),
            user: users[i].clone(),
            group: groups[i].clone(),
            mtime: mtimes[i],
            mode,
            flags: flags[i],
            ino: inodes[i],
            nlinks,
            digest,
        };
        if ghost {
            ghosts.push(info.clone());
        }
        files.insert(name, info);
    }
    Ok((files, ghosts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{hash_bytes, EMPTY_SHA256};
    use crate::rpm::header::testutil::*;
    use crate::rpm::header;
    use std::io::Write;

    const HELLO: &[u8] = b"#!/bin/sh\necho hello\n";

    fn lead() -> Vec<u8> {
        let mut lead = vec![0u8; 96];
        lead[..4].copy_from_slice(&[0xed, 0xab, 0xee, 0xdb]);
        lead[4] = 3;
        lead
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn payload_blob() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&cpio::encode(
            &cpio::CpioEntry {
                ino: 1,
                mode: 0o100755,
                nlink: 1,
                mtime: 1650000000,
                ..Default::default()
            },
            "./usr/bin/hello",
            HELLO,
            false,
        ));
        data.extend_from_slice(&cpio::encode(
            &cpio::CpioEntry::default(),
            cpio::TRAILER,
            b"",
            false,
        ));
        gzip(&data)
    }

    // One regular file /usr/bin/hello plus a ghost /var/log/hello.log.
    fn test_rpm() -> Vec<u8> {
        let digest = hex::encode(hash_bytes(crate::checksum::HashAlgorithm::Sha256, HELLO));
        let main = build_header(
            &[
                (header::RPMTAG_SHA1HEADER, TYPE_STRING, strings(&["0123456789012345678901234567890123456789"]), 1),
                (header::RPMTAG_NAME, TYPE_STRING, strings(&["hello"]), 1),
                (header::RPMTAG_VERSION, TYPE_STRING, strings(&["1.0"]), 1),
                (header::RPMTAG_RELEASE, TYPE_STRING, strings(&["1"]), 1),
                (header::RPMTAG_SUMMARY, TYPE_STRING, strings(&["Hello"]), 1),
                (header::RPMTAG_DESCRIPTION, TYPE_STRING, strings(&["Hello, world"]), 1),
                (header::RPMTAG_BUILDTIME, TYPE_INT32, u32s(&[1650000000]), 1),
                (header::RPMTAG_BUILDHOST, TYPE_STRING, strings(&["builder"]), 1),
                (header::RPMTAG_LICENSE, TYPE_STRING, strings(&["MIT"]), 1),
                (header::RPMTAG_GROUP, TYPE_STRING, strings(&["Development/Tools"]), 1),
                (header::RPMTAG_ARCH, TYPE_STRING, strings(&["x86_64"]), 1),
                (header::RPMTAG_SOURCERPM, TYPE_STRING, strings(&["hello-1.0-1.src.rpm"]), 1),
                (header::RPMTAG_FILESIZES, TYPE_INT32, u32s(&[HELLO.len() as u32, 0]), 2),
                (header::RPMTAG_FILEMODES, TYPE_INT16, u16s(&[0o100755, 0o100644]), 2),
                (header::RPMTAG_FILEMTIMES, TYPE_INT32, u32s(&[1650000000, 1650000000]), 2),
                (header::RPMTAG_FILEDIGESTS, TYPE_STRING_ARRAY, strings(&[digest.as_str(), ""]), 2),
                (header::RPMTAG_FILEFLAGS, TYPE_INT32, u32s(&[0, crate::rpm::RPMFILE_GHOST]), 2),
                (header::RPMTAG_FILEUSERNAME, TYPE_STRING_ARRAY, strings(&["root", "root"]), 2),
                (header::RPMTAG_FILEGROUPNAME, TYPE_STRING_ARRAY, strings(&["root", "root"]), 2),
                (header::RPMTAG_FILEINODES, TYPE_INT32, u32s(&[1, 2]), 2),
                (header::RPMTAG_DIRINDEXES, TYPE_INT32, u32s(&[0, 1]), 2),
                (header::RPMTAG_BASENAMES, TYPE_STRING_ARRAY, strings(&["hello", "hello.log"]), 2),
                (header::RPMTAG_DIRNAMES, TYPE_STRING_ARRAY, strings(&["/usr/bin/", "/var/log/"]), 2),
                (header::RPMTAG_REQUIRENAME, TYPE_STRING_ARRAY, strings(&["/bin/sh"]), 1),
                (header::RPMTAG_REQUIREFLAGS, TYPE_INT32, u32s(&[0]), 1),
                (header::RPMTAG_REQUIREVERSION, TYPE_STRING_ARRAY, strings(&[""]), 1),
                (header::RPMTAG_PROVIDENAME, TYPE_STRING_ARRAY, strings(&["hello"]), 1),
                (header::RPMTAG_PROVIDEFLAGS, TYPE_INT32, u32s(&[header::RPMSENSE_EQUAL]), 1),
                (header::RPMTAG_PROVIDEVERSION, TYPE_STRING_ARRAY, strings(&["1.0-1"]), 1),
                (header::RPMTAG_FILEDIGESTALGO, TYPE_INT32, u32s(&[8]), 1),
            ],
            false,
        );
        let signature = build_header(&[], true);

        let mut rpm = lead();
        rpm.extend_from_slice(&signature);
        rpm.extend_from_slice(&main);
        rpm.extend_from_slice(&payload_blob());
        rpm
    }

    fn write_rpm(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_header_fields() {
        let file = write_rpm(&test_rpm());
        let parser = RpmParser::open(file.path()).unwrap();
        let info = parser.package();
        assert_eq!(info.name, "hello");
        assert_eq!(info.kind, PackageKind::Binary);
        assert_eq!(info.epoch, None);
        assert_eq!(parser.nevra(), "hello-1.0-1.x86_64");
        assert_eq!(info.source_rpm, "hello-1.0-1.src.rpm");

        let deps = parser.dependencies();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].kind, DependencyKind::Requires);
        assert_eq!(deps[0].capability, "/bin/sh");
        assert_eq!(deps[0].op, "");
        let provides = &deps[1];
        assert_eq!(provides.kind, DependencyKind::Provides);
        assert_eq!(provides.op, "=");
        assert_eq!(provides.version, "1.0-1");
    }

    #[test]
    fn test_payload_and_ghost() {
        let file = write_rpm(&test_rpm());
        let mut parser = RpmParser::open(file.path()).unwrap();

        let first = parser.read_file().unwrap().unwrap();
        assert_eq!(first.info.name, "/usr/bin/hello");
        assert_eq!(first.contents, HELLO);
        assert_eq!(first.info.mode, 0o100755);
        assert!(!first.info.ghost());

        let ghost = parser.read_file().unwrap().unwrap();
        assert_eq!(ghost.info.name, "/var/log/hello.log");
        assert!(ghost.info.ghost());
        assert!(ghost.contents.is_empty());
        assert_eq!(ghost.info.digest.hex(), EMPTY_SHA256);
        assert_eq!(ghost.info.digest.length, Some(0));

        assert!(parser.read_file().unwrap().is_none());
    }

    fn with_payload(archive_entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        for (name, contents) in archive_entries {
            data.extend_from_slice(&cpio::encode(
                &cpio::CpioEntry {
                    ino: 1,
                    mode: 0o100755,
                    nlink: 1,
                    ..Default::default()
                },
                name,
                contents,
                false,
            ));
        }
        data.extend_from_slice(&cpio::encode(
            &cpio::CpioEntry::default(),
            cpio::TRAILER,
            b"",
            false,
        ));
        let mut rpm = test_rpm();
        let payload_start = rpm.len() - payload_blob().len();
        rpm.truncate(payload_start);
        rpm.extend_from_slice(&gzip(&data));
        rpm
    }

    #[test]
    fn test_trailer_count_mismatch() {
        // Empty archive, but the header file table expects one entry.
        let file = write_rpm(&with_payload(&[]));
        let mut parser = RpmParser::open(file.path()).unwrap();
        let err = parser.read_file().unwrap_err();
        assert!(err.to_string().contains("instead of"), "{}", err);
    }

    #[test]
    fn test_unknown_payload_name() {
        let file = write_rpm(&with_payload(&[("./usr/bin/stranger", b"")]));
        let mut parser = RpmParser::open(file.path()).unwrap();
        let err = parser.read_file().unwrap_err();
        assert!(err.to_string().contains("not found in RPM header"), "{}", err);
    }
}
