use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, Context, Result};
use postgres::{Client, NoTls};

use crate::elf::{ElfImage, ElfSymbolDefinition, ElfSymbolReference};
use crate::java::JavaClass;
use crate::rpm::{RpmDependency, RpmFileInfo, RpmPackageInfo};

/// Lock namespace for package sets.
pub const PACKAGE_SET_LOCK_TAG: i32 = 1667369644;

const URL_CACHE_EXPIRY: &str = "7 days";

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub i32);
    };
}

id_type!(PackageId);
id_type!(FileId);
id_type!(ContentsId);
id_type!(PackageSetId);

/// Database wrapper. Each thread owns its own instance; transactions
/// are explicit and span multiple calls.
pub struct Database {
    client: RefCell<Client>,
    in_transaction: Cell<bool>,
}

/// Advisory lock handle. Transaction-scoped locks are released by the
/// server when the transaction concludes; session-scoped locks are
/// released on drop. (A session lock cannot be unlocked from within an
/// aborted transaction, hence the split.)
pub struct AdvisoryLock<'a> {
    db: &'a Database,
    session_keys: Option<(i32, i32)>,
}

impl Drop for AdvisoryLock<'_> {
    fn drop(&mut self) {
        if let Some((a, b)) = self.session_keys {
            let _ = self
                .db
                .client
                .borrow_mut()
                .execute("SELECT pg_advisory_unlock($1, $2)", &[&a, &b]);
        }
    }
}

pub const SCHEMA: &str = include_str!("schema.sql");

/// Joined row for the link-closure resolver: one ELF file in a set.
#[derive(Clone, Debug)]
pub struct ElfFileRow {
    pub file: FileId,
    pub package: PackageId,
    pub name: String,
    pub contents: ContentsId,
    pub ei_class: i16,
    pub ei_data: i16,
    pub soname: Option<String>,
}

/// Joined soname conflict row for reporting.
#[derive(Clone, Debug)]
pub struct SonameConflictRow {
    pub file_name: String,
    pub package_nevra: String,
    pub needed_name: String,
    pub position: i32,
    pub candidate_name: String,
    pub candidate_nevra: String,
}

impl Database {
    pub fn connect(conninfo: &str) -> Result<Database> {
        let client = Client::connect(conninfo, NoTls)
            .with_context(|| format!("could not connect to database {:?}", conninfo))?;
        let r = Database {
            client: RefCell::new(client),
            in_transaction: Cell::new(false),
        };
        Ok(r)
    }

    pub fn create_schema(&self) -> Result<()> {
        self.client
            .borrow_mut()
            .batch_execute(SCHEMA)
            .context("schema creation failed")?;
        Ok(())
    }

    pub fn txn_begin(&self) -> Result<()> {
        self.client.borrow_mut().batch_execute("BEGIN")?;
        self.in_transaction.set(true);
        Ok(())
    }

    /// Transaction with synchronous_commit = off. Good enough for data
    /// that is not yet referenced; a durable commit happens when an RPM
    /// is linked into a set or the URL cache.
    pub fn txn_begin_no_sync(&self) -> Result<()> {
        self.client
            .borrow_mut()
            .batch_execute("BEGIN; SET LOCAL synchronous_commit TO OFF")?;
        self.in_transaction.set(true);
        Ok(())
    }

    pub fn txn_commit(&self) -> Result<()> {
        self.client.borrow_mut().batch_execute("COMMIT")?;
        self.in_transaction.set(false);
        Ok(())
    }

    pub fn txn_rollback(&self) -> Result<()> {
        self.client.borrow_mut().batch_execute("ROLLBACK")?;
        self.in_transaction.set(false);
        Ok(())
    }

    /// Advisory lock on a pair of integers: transaction-scoped inside a
    /// transaction, session-scoped otherwise.
    pub fn lock(&self, a: i32, b: i32) -> Result<AdvisoryLock<'_>> {
        if self.in_transaction.get() {
            self.client
                .borrow_mut()
                .execute("SELECT pg_advisory_xact_lock($1, $2)", &[&a, &b])?;
            Ok(AdvisoryLock {
                db: self,
                session_keys: None,
            })
        } else {
            self.client
                .borrow_mut()
                .execute("SELECT pg_advisory_lock($1, $2)", &[&a, &b])?;
            Ok(AdvisoryLock {
                db: self,
                session_keys: Some((a, b)),
            })
        }
    }

    /// Locks a digest by its first 8 bytes.
    pub fn lock_digest(&self, digest: &[u8]) -> Result<AdvisoryLock<'_>> {
        if digest.len() < 8 {
            bail!("digest is too short to lock");
        }
        let a = i32::from_be_bytes(digest[0..4].try_into().unwrap());
        let b = i32::from_be_bytes(digest[4..8].try_into().unwrap());
        self.lock(a, b)
    }

    // Packages.

    /// Returns the id and whether the package was freshly inserted. The
    /// header hash is the identity; concurrent inserts of the same
    /// package collapse onto the winner's row.
    pub fn intern_package(&self, info: &RpmPackageInfo) -> Result<(PackageId, bool)> {
        let mut client = self.client.borrow_mut();
        if let Some(row) = client.query_opt(
            "SELECT package_id FROM symboldb.package WHERE hash = $1",
            &[&info.hash],
        )? {
            return Ok((PackageId(row.get(0)), false));
        }
        let inserted = client.query_opt(
            "INSERT INTO symboldb.package (name, epoch, version, release, arch, \
             source_rpm, build_time, build_host, summary, description, license, \
             rpm_group, hash, kind) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (hash) DO NOTHING RETURNING package_id",
            &[
                &info.name,
                &info.epoch,
                &info.version,
                &info.release,
                &info.arch,
                &info.source_rpm,
                &info.build_time,
                &info.build_host,
                &info.summary,
                &info.description,
                &info.license,
                &info.group,
                &info.hash,
                &info.kind.as_str(),
            ],
        )?;
        match inserted {
            Some(row) => Ok((PackageId(row.get(0)), true)),
            None => {
                let row = client.query_one(
                    "SELECT package_id FROM symboldb.package WHERE hash = $1",
                    &[&info.hash],
                )?;
                Ok((PackageId(row.get(0)), false))
            }
        }
    }

    /// Records an alternate digest of the package's file representation.
    /// One package can have several due to signatures and compression.
    pub fn add_package_digest(&self, pkg: PackageId, digest: &[u8], length: u64) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.package_digest (digest, length, package_id) \
             VALUES ($1, $2, $3) ON CONFLICT (digest) DO NOTHING",
            &[&digest, &(length as i64), &pkg.0],
        )?;
        Ok(())
    }

    pub fn package_by_digest(&self, digest: &[u8]) -> Result<Option<PackageId>> {
        let row = self.client.borrow_mut().query_opt(
            "SELECT package_id FROM symboldb.package_digest WHERE digest = $1",
            &[&digest],
        )?;
        Ok(row.map(|row| PackageId(row.get(0))))
    }

    pub fn add_package_url(&self, pkg: PackageId, url: &str) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.package_url (package_id, url) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
            &[&pkg.0, &url],
        )?;
        Ok(())
    }

    pub fn add_package_dependency(&self, pkg: PackageId, dep: &RpmDependency) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.package_dependency \
             (package_id, kind, capability, op, version, pre) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &pkg.0,
                &dep.kind.as_str(),
                &dep.capability,
                &dep.op,
                &dep.version,
                &dep.pre,
            ],
        )?;
        Ok(())
    }

    // Files and contents.

    /// Interns the contents row by digest and inserts the file row.
    /// Returns the file id, the contents id, and whether the contents
    /// row is fresh (and thus needs analyzer output).
    pub fn add_file(
        &self,
        pkg: PackageId,
        info: &RpmFileInfo,
        digest: &[u8],
        length: u64,
        preview: &[u8],
    ) -> Result<(FileId, ContentsId, bool)> {
        let (contents, fresh) = self.intern_contents(digest, length, preview)?;
        let row = self.client.borrow_mut().query_one(
            "INSERT INTO symboldb.file (package_id, contents_id, name, user_name, \
             group_name, mtime, mode, flags, ino, nlinks) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING file_id",
            &[
                &pkg.0,
                &contents.0,
                &info.name,
                &info.user,
                &info.group,
                &i64::from(info.mtime),
                &i64::from(info.mode),
                &i64::from(info.flags),
                &i64::from(info.ino),
                &(info.nlinks as i32),
            ],
        )?;
        Ok((FileId(row.get(0)), contents, fresh))
    }

    fn intern_contents(
        &self,
        digest: &[u8],
        length: u64,
        preview: &[u8],
    ) -> Result<(ContentsId, bool)> {
        let mut client = self.client.borrow_mut();
        if let Some(row) = client.query_opt(
            "SELECT contents_id FROM symboldb.file_contents WHERE digest = $1",
            &[&digest],
        )? {
            return Ok((ContentsId(row.get(0)), false));
        }
        let inserted = client.query_opt(
            "INSERT INTO symboldb.file_contents (digest, length, preview) \
             VALUES ($1, $2, $3) ON CONFLICT (digest) DO NOTHING RETURNING contents_id",
            &[&digest, &(length as i64), &preview],
        )?;
        match inserted {
            Some(row) => Ok((ContentsId(row.get(0)), true)),
            None => {
                let row = client.query_one(
                    "SELECT contents_id FROM symboldb.file_contents WHERE digest = $1",
                    &[&digest],
                )?;
                Ok((ContentsId(row.get(0)), false))
            }
        }
    }

    pub fn add_directory(&self, pkg: PackageId, info: &RpmFileInfo) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.directory \
             (package_id, name, user_name, group_name, mtime, mode, flags) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT DO NOTHING",
            &[
                &pkg.0,
                &info.name,
                &info.user,
                &info.group,
                &i64::from(info.mtime),
                &i64::from(info.mode),
                &i64::from(info.flags),
            ],
        )?;
        Ok(())
    }

    pub fn add_symlink(&self, pkg: PackageId, info: &RpmFileInfo, target: &str) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.symlink \
             (package_id, name, target, user_name, group_name, mtime, flags) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT DO NOTHING",
            &[
                &pkg.0,
                &info.name,
                &target,
                &info.user,
                &info.group,
                &i64::from(info.mtime),
                &i64::from(info.flags),
            ],
        )?;
        Ok(())
    }

    // ELF tables, keyed by contents.

    pub fn add_elf_image(
        &self,
        contents: ContentsId,
        image: &ElfImage,
        soname: Option<&str>,
    ) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.elf_file \
             (contents_id, ei_class, ei_data, e_type, e_machine, arch, soname, build_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (contents_id) DO NOTHING",
            &[
                &contents.0,
                &i16::from(image.ei_class),
                &i16::from(image.ei_data),
                &i32::from(image.e_type),
                &i32::from(image.e_machine),
                &image.arch,
                &soname,
                &image.build_id.as_deref(),
            ],
        )?;
        Ok(())
    }

    pub fn add_elf_symbol_definition(
        &self,
        contents: ContentsId,
        def: &ElfSymbolDefinition,
    ) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.elf_definition (contents_id, name, version, \
             primary_version, symbol_value, section, binding, symbol_type, visibility) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &contents.0,
                &def.name,
                &def.version,
                &def.default_version,
                &(def.value as i64),
                &(def.section as i32),
                &i16::from(def.binding),
                &i16::from(def.symbol_type),
                &i16::from(def.visibility),
            ],
        )?;
        Ok(())
    }

    pub fn add_elf_symbol_reference(
        &self,
        contents: ContentsId,
        reference: &ElfSymbolReference,
    ) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.elf_reference (contents_id, name, version, weak) \
             VALUES ($1, $2, $3, $4)",
            &[&contents.0, &reference.name, &reference.version, &reference.weak],
        )?;
        Ok(())
    }

    pub fn add_elf_needed(&self, contents: ContentsId, name: &str) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.elf_needed (contents_id, name) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
            &[&contents.0, &name],
        )?;
        Ok(())
    }

    pub fn add_elf_rpath(&self, contents: ContentsId, path: &str) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.elf_rpath (contents_id, path) VALUES ($1, $2)",
            &[&contents.0, &path],
        )?;
        Ok(())
    }

    pub fn add_elf_runpath(&self, contents: ContentsId, path: &str) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.elf_runpath (contents_id, path) VALUES ($1, $2)",
            &[&contents.0, &path],
        )?;
        Ok(())
    }

    pub fn add_elf_error(&self, contents: ContentsId, message: &str) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.elf_error (contents_id, message) VALUES ($1, $2)",
            &[&contents.0, &message],
        )?;
        Ok(())
    }

    // Java and Python tables.

    pub fn add_java_class(&self, contents: ContentsId, class: &JavaClass) -> Result<()> {
        let mut client = self.client.borrow_mut();
        let row = client.query_one(
            "INSERT INTO symboldb.java_class (access_flags, name, super_class) \
             VALUES ($1, $2, $3) RETURNING java_class_id",
            &[
                &i32::from(class.access_flags),
                &class.this_class,
                &class.super_class,
            ],
        )?;
        let class_id: i32 = row.get(0);
        client.execute(
            "INSERT INTO symboldb.java_class_contents (class_id, contents_id) \
             VALUES ($1, $2)",
            &[&class_id, &contents.0],
        )?;
        for interface in &class.interfaces {
            client.execute(
                "INSERT INTO symboldb.java_interface (class_id, name) VALUES ($1, $2)",
                &[&class_id, &interface],
            )?;
        }
        for reference in &class.class_references {
            client.execute(
                "INSERT INTO symboldb.java_class_reference (class_id, name) \
                 VALUES ($1, $2)",
                &[&class_id, &reference],
            )?;
        }
        Ok(())
    }

    pub fn add_java_error(&self, contents: ContentsId, message: &str, path: &str) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.java_error (contents_id, message, path) \
             VALUES ($1, $2, $3)",
            &[&contents.0, &message, &path],
        )?;
        Ok(())
    }

    pub fn add_python_import(&self, contents: ContentsId, name: &str) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.python_import (contents_id, name) VALUES ($1, $2)",
            &[&contents.0, &name],
        )?;
        Ok(())
    }

    pub fn add_python_error(&self, contents: ContentsId, line: u32, message: &str) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.python_error (contents_id, line, message) \
             VALUES ($1, $2, $3)",
            &[&contents.0, &(line as i32), &message],
        )?;
        Ok(())
    }

    pub fn has_python_imports(&self, contents: ContentsId) -> Result<bool> {
        let row = self.client.borrow_mut().query_opt(
            "SELECT 1 FROM symboldb.python_import WHERE contents_id = $1 LIMIT 1",
            &[&contents.0],
        )?;
        Ok(row.is_some())
    }

    // Package sets.

    pub fn create_package_set(&self, name: &str) -> Result<PackageSetId> {
        let row = self.client.borrow_mut().query_one(
            "INSERT INTO symboldb.package_set (name) VALUES ($1) RETURNING set_id",
            &[&name],
        )?;
        Ok(PackageSetId(row.get(0)))
    }

    pub fn lookup_package_set(&self, name: &str) -> Result<Option<PackageSetId>> {
        let row = self.client.borrow_mut().query_opt(
            "SELECT set_id FROM symboldb.package_set WHERE name = $1",
            &[&name],
        )?;
        Ok(row.map(|row| PackageSetId(row.get(0))))
    }

    pub fn add_package_set(&self, set: PackageSetId, pkg: PackageId) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.package_set_member (set_id, package_id) \
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
            &[&set.0, &pkg.0],
        )?;
        Ok(())
    }

    pub fn delete_from_package_set(&self, set: PackageSetId, pkg: PackageId) -> Result<()> {
        self.client.borrow_mut().execute(
            "DELETE FROM symboldb.package_set_member \
             WHERE set_id = $1 AND package_id = $2",
            &[&set.0, &pkg.0],
        )?;
        Ok(())
    }

    pub fn empty_package_set(&self, set: PackageSetId) -> Result<()> {
        self.client.borrow_mut().execute(
            "DELETE FROM symboldb.package_set_member WHERE set_id = $1",
            &[&set.0],
        )?;
        Ok(())
    }

    /// Replaces the set membership. Returns whether anything changed.
    pub fn update_package_set(&self, set: PackageSetId, ids: &BTreeSet<PackageId>) -> Result<bool> {
        let current: BTreeSet<PackageId> = {
            let mut client = self.client.borrow_mut();
            client
                .query(
                    "SELECT package_id FROM symboldb.package_set_member WHERE set_id = $1",
                    &[&set.0],
                )?
                .iter()
                .map(|row| PackageId(row.get(0)))
                .collect()
        };
        let mut changed = false;
        for stale in current.difference(ids) {
            self.delete_from_package_set(set, *stale)?;
            changed = true;
        }
        for fresh in ids.difference(&current) {
            self.add_package_set(set, *fresh)?;
            changed = true;
        }
        Ok(changed)
    }

    // URL cache.

    pub fn url_cache_fetch(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let row = self.client.borrow_mut().query_opt(
            "SELECT data FROM symboldb.url_cache WHERE url = $1",
            &[&url],
        )?;
        Ok(row.map(|row| row.get(0)))
    }

    /// Cache hit only when the stored length and modification time still
    /// match what the server reports.
    pub fn url_cache_fetch_checked(
        &self,
        url: &str,
        expected_length: u64,
        expected_time: i64,
    ) -> Result<Option<Vec<u8>>> {
        let row = self.client.borrow_mut().query_opt(
            "SELECT data FROM symboldb.url_cache \
             WHERE url = $1 AND http_time = $2 AND octet_length(data) = $3",
            &[&url, &expected_time, &(expected_length as i32)],
        )?;
        Ok(row.map(|row| row.get(0)))
    }

    pub fn url_cache_update(&self, url: &str, data: &[u8], time: i64) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.url_cache (url, http_time, data, last_visit) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (url) DO UPDATE \
             SET http_time = EXCLUDED.http_time, data = EXCLUDED.data, \
                 last_visit = now()",
            &[&url, &time, &data],
        )?;
        Ok(())
    }

    // Expiration.

    pub fn expire_url_cache(&self) -> Result<u64> {
        let sql = format!(
            "DELETE FROM symboldb.url_cache \
             WHERE last_visit < now() - INTERVAL '{}'",
            URL_CACHE_EXPIRY
        );
        let r = self.client.borrow_mut().execute(sql.as_str(), &[])?;
        Ok(r)
    }

    pub fn expire_packages(&self) -> Result<u64> {
        let r = self.client.borrow_mut().execute(
            "DELETE FROM symboldb.package WHERE package_id NOT IN \
             (SELECT package_id FROM symboldb.package_set_member)",
            &[],
        )?;
        Ok(r)
    }

    pub fn expire_file_contents(&self) -> Result<u64> {
        let r = self.client.borrow_mut().execute(
            "DELETE FROM symboldb.file_contents WHERE contents_id NOT IN \
             (SELECT contents_id FROM symboldb.file)",
            &[],
        )?;
        Ok(r)
    }

    pub fn expire_java_classes(&self) -> Result<u64> {
        let r = self.client.borrow_mut().execute(
            "DELETE FROM symboldb.java_class WHERE java_class_id NOT IN \
             (SELECT class_id FROM symboldb.java_class_contents)",
            &[],
        )?;
        Ok(r)
    }

    /// All digests of package representations still present in the
    /// database, sorted.
    pub fn referenced_package_digests(&self) -> Result<Vec<Vec<u8>>> {
        let rows = self.client.borrow_mut().query(
            "SELECT digest FROM symboldb.package_digest ORDER BY digest",
            &[],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    // Link-closure support.

    pub fn elf_files_in_set(&self, set: PackageSetId) -> Result<Vec<ElfFileRow>> {
        let rows = self.client.borrow_mut().query(
            "SELECT f.file_id, f.package_id, f.name, f.contents_id, \
                    e.ei_class, e.ei_data, e.soname \
             FROM symboldb.package_set_member psm \
             JOIN symboldb.file f ON f.package_id = psm.package_id \
             JOIN symboldb.elf_file e ON e.contents_id = f.contents_id \
             WHERE psm.set_id = $1 \
             ORDER BY f.package_id, f.name",
            &[&set.0],
        )?;
        let r = rows
            .iter()
            .map(|row| ElfFileRow {
                file: FileId(row.get(0)),
                package: PackageId(row.get(1)),
                name: row.get(2),
                contents: ContentsId(row.get(3)),
                ei_class: row.get(4),
                ei_data: row.get(5),
                soname: row.get(6),
            })
            .collect();
        Ok(r)
    }

    /// Needed sonames per contents row, for the files of one set.
    pub fn elf_needed_in_set(&self, set: PackageSetId) -> Result<HashMap<ContentsId, Vec<String>>> {
        let rows = self.client.borrow_mut().query(
            "SELECT DISTINCT n.contents_id, n.name \
             FROM symboldb.elf_needed n \
             WHERE n.contents_id IN \
               (SELECT f.contents_id FROM symboldb.package_set_member psm \
                JOIN symboldb.file f ON f.package_id = psm.package_id \
                WHERE psm.set_id = $1) \
             ORDER BY n.contents_id, n.name",
            &[&set.0],
        )?;
        let mut map: HashMap<ContentsId, Vec<String>> = HashMap::new();
        for row in &rows {
            map.entry(ContentsId(row.get(0)))
                .or_default()
                .push(row.get(1));
        }
        Ok(map)
    }

    pub fn clear_elf_closure(&self, set: PackageSetId) -> Result<()> {
        let mut client = self.client.borrow_mut();
        client.execute(
            "DELETE FROM symboldb.elf_closure WHERE set_id = $1",
            &[&set.0],
        )?;
        client.execute(
            "DELETE FROM symboldb.elf_closure_conflict WHERE set_id = $1",
            &[&set.0],
        )?;
        Ok(())
    }

    pub fn add_elf_closure(
        &self,
        set: PackageSetId,
        file: FileId,
        needed_name: &str,
        target: Option<FileId>,
    ) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.elf_closure \
             (set_id, file_id, needed_name, target_file_id) VALUES ($1, $2, $3, $4)",
            &[&set.0, &file.0, &needed_name, &target.map(|t| t.0)],
        )?;
        Ok(())
    }

    pub fn add_elf_closure_conflict(
        &self,
        set: PackageSetId,
        file: FileId,
        needed_name: &str,
        candidate: FileId,
        position: i32,
    ) -> Result<()> {
        self.client.borrow_mut().execute(
            "INSERT INTO symboldb.elf_closure_conflict \
             (set_id, file_id, needed_name, candidate_file_id, position) \
             VALUES ($1, $2, $3, $4, $5)",
            &[&set.0, &file.0, &needed_name, &candidate.0, &position],
        )?;
        Ok(())
    }

    pub fn soname_conflicts(&self, set: PackageSetId) -> Result<Vec<SonameConflictRow>> {
        let rows = self.client.borrow_mut().query(
            "SELECT f.name, \
                    p.name || '-' || p.version || '-' || p.release || '.' || p.arch, \
                    c.needed_name, c.position, cf.name, \
                    cp.name || '-' || cp.version || '-' || cp.release || '.' || cp.arch \
             FROM symboldb.elf_closure_conflict c \
             JOIN symboldb.file f ON f.file_id = c.file_id \
             JOIN symboldb.package p ON p.package_id = f.package_id \
             JOIN symboldb.file cf ON cf.file_id = c.candidate_file_id \
             JOIN symboldb.package cp ON cp.package_id = cf.package_id \
             WHERE c.set_id = $1 \
             ORDER BY f.name, c.needed_name, c.position",
            &[&set.0],
        )?;
        let r = rows
            .iter()
            .map(|row| SonameConflictRow {
                file_name: row.get(0),
                package_nevra: row.get(1),
                needed_name: row.get(2),
                position: row.get(3),
                candidate_name: row.get(4),
                candidate_nevra: row.get(5),
            })
            .collect();
        Ok(r)
    }

    /// Trap door for diagnostics.
    pub fn exec_sql(&self, command: &str) -> Result<()> {
        self.client.borrow_mut().batch_execute(command)?;
        Ok(())
    }
}
