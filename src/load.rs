use std::path::Path;

use anyhow::{bail, Result};
use slog_scope::{debug, info};

use crate::checksum::{hash_bytes, hash_file_pair, Checksum, HashAlgorithm};
use crate::db::{ContentsId, Database, PackageId};
use crate::elf::{self, DynamicEntry, ElfImage};
use crate::hardlink::HardlinkMap;
use crate::java;
use crate::python::{self, PythonAnalyzer};
use crate::rpm::parser::{RpmFileEntry, RpmParser};
use crate::rpm::{PackageKind, RpmPackageInfo};

const PREVIEW_LENGTH: usize = 64;

/// Loads one RPM file in a single transaction. Returns the package id
/// and the header info; an already-interned package is skipped but its
/// file representation digests are still recorded. EXPECTED, when
/// given, is verified against the matching full-file digest.
pub fn rpm_load(
    db: &Database,
    path: &Path,
    expected: Option<&Checksum>,
    url: Option<&str>,
) -> Result<(PackageId, RpmPackageInfo)> {
    if let Some(expected) = expected {
        if expected.algorithm == HashAlgorithm::Md5 {
            bail!("unsupported hash type {}", expected.algorithm);
        }
    }

    // Unreferenced packages are invisible to queries, so each RPM can
    // load in its own transaction, and a non-synchronous commit is
    // sufficient until the package is linked into a set.
    db.txn_begin_no_sync()?;
    let result = load_within_transaction(db, path, expected, url);
    match result {
        Ok(value) => {
            db.txn_commit()?;
            Ok(value)
        }
        Err(err) => {
            let _ = db.txn_rollback();
            Err(err)
        }
    }
}

fn load_within_transaction(
    db: &Database,
    path: &Path,
    expected: Option<&Checksum>,
    url: Option<&str>,
) -> Result<(PackageId, RpmPackageInfo)> {
    let (pkg, info) = load_rpm_internal(db, path)?;

    let (sha256, sha1) = hash_file_pair(path)?;
    db.add_package_digest(pkg, &sha256.value, sha256.length.unwrap_or(0))?;
    db.add_package_digest(pkg, &sha1.value, sha1.length.unwrap_or(0))?;
    if let Some(expected) = expected {
        let actual = match expected.algorithm {
            HashAlgorithm::Sha256 => &sha256,
            HashAlgorithm::Sha1 => &sha1,
            HashAlgorithm::Md5 => unreachable!(),
        };
        if expected.value != actual.value {
            bail!(
                "checksum mismatch for {:?} (actual {}, expected {})",
                path,
                actual.hex(),
                expected.hex()
            );
        }
    }
    if let Some(url) = url {
        db.add_package_url(pkg, url)?;
    }
    Ok((pkg, info))
}

fn load_rpm_internal(db: &Database, path: &Path) -> Result<(PackageId, RpmPackageInfo)> {
    let mut parser = RpmParser::open(path)?;
    let info = parser.package().clone();

    // Guards against concurrent insertion of the same RPM. The handle
    // can be dropped immediately: the lock is transaction-scoped here.
    let _lock = db.lock_digest(info.hash.as_bytes())?;

    let (pkg, fresh) = db.intern_package(&info)?;
    if !fresh {
        info!("skipping {} from {}", info.nevra(), path.display());
        return Ok((pkg, info));
    }
    info!("loading {} from {}", info.nevra(), path.display());

    for dep in parser.dependencies() {
        db.add_package_dependency(pkg, dep)?;
    }

    let mut python = PythonAnalyzer::new();
    let mut hardlinks = HardlinkMap::new();
    while let Some(mut entry) = parser.read_file()? {
        entry.info.normalize_name();
        debug!(
            "{} {} {}:{} {:o} {} bytes",
            info.nevra(),
            entry.info.name,
            entry.info.user,
            entry.info.group,
            entry.info.mode,
            entry.contents.len()
        );
        if entry.info.is_directory() {
            db.add_directory(pkg, &entry.info)?;
        } else if entry.info.is_symlink() {
            let target = crate::rpm::decode_header_string(&entry.contents);
            db.add_symlink(pkg, &entry.info, &target)?;
        } else {
            for mut ready in hardlinks.push(entry)? {
                adjust_for_ghost(&mut ready);
                add_file(db, &mut python, &info, pkg, path, ready)?;
            }
        }
    }
    Ok((pkg, info))
}

/// Ghost sizes and digests come from the build root, which is gone;
/// an empty payload entry gets the well-known empty digest.
fn adjust_for_ghost(entry: &mut RpmFileEntry) {
    if entry.info.ghost() && entry.contents.is_empty() {
        entry.info.digest = Checksum::empty_sha256();
    }
}

fn add_file(
    db: &Database,
    python: &mut PythonAnalyzer,
    pkginfo: &RpmPackageInfo,
    pkg: PackageId,
    rpm_path: &Path,
    entry: RpmFileEntry,
) -> Result<()> {
    let digest = hash_bytes(HashAlgorithm::Sha256, &entry.contents);
    check_digest(rpm_path, &entry, &digest)?;
    let preview = &entry.contents[..entry.contents.len().min(PREVIEW_LENGTH)];
    let (_file, contents, fresh) = db.add_file(
        pkg,
        &entry.info,
        &digest,
        entry.contents.len() as u64,
        preview,
    )?;
    // Source packages carry their files but are not unpacked further.
    if fresh && pkginfo.kind == PackageKind::Binary {
        load_formats(db, python, contents, &entry)?;
    }
    Ok(())
}

/// The header digest is our only integrity check on the payload; a
/// mismatch poisons the whole package. Special files carry no digest
/// at all and are left unchecked.
fn check_digest(rpm_path: &Path, entry: &RpmFileEntry, sha256: &[u8]) -> Result<()> {
    if entry.info.digest.value.is_empty() {
        return Ok(());
    }
    let actual = if entry.info.digest.algorithm == HashAlgorithm::Sha256 {
        sha256.to_vec()
    } else {
        hash_bytes(entry.info.digest.algorithm, &entry.contents)
    };
    if actual != entry.info.digest.value {
        bail!(
            "{}: digest mismatch for {} (actual {}, expected {})",
            rpm_path.display(),
            entry.info.name,
            hex::encode(actual),
            entry.info.digest.hex()
        );
    }
    Ok(())
}

fn load_formats(
    db: &Database,
    python: &mut PythonAnalyzer,
    contents: ContentsId,
    entry: &RpmFileEntry,
) -> Result<()> {
    if elf::is_elf(&entry.contents) {
        load_elf(db, contents, entry)?;
    } else if python::is_python(&entry.contents) {
        load_python(db, python, contents, entry)?;
    } else if java::has_class_signature(&entry.contents) {
        match java::JavaClass::parse(&entry.contents) {
            Ok(class) => db.add_java_class(contents, &class)?,
            Err(err) => db.add_java_error(contents, &err.to_string(), "")?,
        }
    }
    if java::has_zip_signature(&entry.contents) {
        let (classes, errors) = java::scan_jar(&entry.contents);
        for class in &classes {
            db.add_java_class(contents, class)?;
        }
        for error in &errors {
            db.add_java_error(contents, &error.message, &error.member)?;
        }
    }
    Ok(())
}

fn load_elf(db: &Database, contents: ContentsId, entry: &RpmFileEntry) -> Result<()> {
    let image = match ElfImage::parse(&entry.contents) {
        Ok(image) => image,
        Err(err) => {
            // Parse failures become error rows, never package failures.
            db.add_elf_error(contents, &format!("{:#}", err))?;
            return Ok(());
        }
    };
    for def in &image.definitions {
        db.add_elf_symbol_definition(contents, def)?;
    }
    for reference in &image.references {
        db.add_elf_symbol_reference(contents, reference)?;
    }
    let mut soname: Option<&str> = None;
    for dynamic in &image.dynamic {
        match dynamic {
            DynamicEntry::Needed(name) => db.add_elf_needed(contents, name)?,
            DynamicEntry::Soname(name) => match soname {
                None => soname = Some(name),
                Some(previous) => {
                    // The dynamic linker ignores most subsequent
                    // sonames; multiple sonames are rare.
                    if name != previous {
                        db.add_elf_error(
                            contents,
                            &format!(
                                "duplicate soname ignored: {}, previous soname: {}",
                                name, previous
                            ),
                        )?;
                    }
                }
            },
            DynamicEntry::Rpath(path) => db.add_elf_rpath(contents, path)?,
            DynamicEntry::Runpath(path) => db.add_elf_runpath(contents, path)?,
        }
    }
    db.add_elf_image(contents, &image, soname)?;
    Ok(())
}

fn load_python(
    db: &Database,
    python: &mut PythonAnalyzer,
    contents: ContentsId,
    entry: &RpmFileEntry,
) -> Result<()> {
    // A ghost and its target may collapse onto one contents row; keep
    // the import rows idempotent in that case.
    if db.has_python_imports(contents)? {
        return Ok(());
    }
    let analysis = python.parse(&entry.contents)?;
    if !analysis.good() {
        db.add_python_error(contents, analysis.error_line, &analysis.error_message)?;
        return Ok(());
    }
    for import in &analysis.imports {
        db.add_python_import(contents, import)?;
    }
    Ok(())
}
