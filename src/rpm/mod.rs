pub mod cpio;
pub mod header;
pub mod parser;

use serde::Serialize;

use crate::checksum::Checksum;

pub const RPMFILE_CONFIG: u32 = 1 << 0;
pub const RPMFILE_GHOST: u32 = 1 << 6;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Binary,
    Source,
}

impl PackageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Binary => "binary",
            PackageKind::Source => "source",
        }
    }
}

/// Package-level header fields.
#[derive(Clone, Debug, Serialize)]
pub struct RpmPackageInfo {
    pub name: String,
    pub epoch: Option<i32>,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub source_rpm: String,
    pub build_time: i64,
    pub build_host: String,
    pub summary: String,
    pub description: String,
    pub license: String,
    pub group: String,
    /// Header SHA-1, 40 hexadecimal characters.
    pub hash: String,
    pub kind: PackageKind,
}

impl RpmPackageInfo {
    pub fn nevra(&self) -> String {
        match self.epoch {
            Some(epoch) => format!(
                "{}-{}:{}-{}.{}",
                self.name, epoch, self.version, self.release, self.arch
            ),
            None => format!(
                "{}-{}-{}.{}",
                self.name, self.version, self.release, self.arch
            ),
        }
    }
}

/// Per-file header fields. The digest covers the payload contents; for
/// ghost files it is fixed to the empty SHA-256.
#[derive(Clone, Debug, Serialize)]
pub struct RpmFileInfo {
    pub name: String,
    pub user: String,
    pub group: String,
    pub mtime: u32,
    pub mode: u32,
    pub flags: u32,
    pub ino: u32,
    pub nlinks: u32,
    pub digest: Checksum,
}

impl RpmFileInfo {
    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn ghost(&self) -> bool {
        self.flags & RPMFILE_GHOST != 0
    }

    pub fn normalize_name(&mut self) {
        if let Some(repaired) = repair_utf8(self.name.as_bytes()) {
            self.name = repaired;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Requires,
    Provides,
    Obsoletes,
    Conflicts,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::Requires => "requires",
            DependencyKind::Provides => "provides",
            DependencyKind::Obsoletes => "obsoletes",
            DependencyKind::Conflicts => "conflicts",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RpmDependency {
    pub kind: DependencyKind,
    pub capability: String,
    /// "", "<", "<=", "=", ">=" or ">".
    pub op: String,
    pub version: String,
    pub pre: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    Pretrans,
    Prein,
    Postin,
    Preun,
    Postun,
    Posttrans,
    Verify,
}

#[derive(Clone, Debug, Serialize)]
pub struct RpmScript {
    pub kind: ScriptKind,
    pub script: Option<String>,
    pub prog: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TriggerCondition {
    pub name: String,
    pub version: String,
    pub flags: i32,
}

#[derive(Clone, Debug, Serialize)]
pub struct RpmTrigger {
    pub script: String,
    pub prog: String,
    pub conditions: Vec<TriggerCondition>,
}

/// Reinterprets a byte string as Latin-1, one code point per byte.
pub fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Returns the Latin-1 reinterpretation when BYTES is not valid UTF-8.
pub fn repair_utf8(bytes: &[u8]) -> Option<String> {
    match std::str::from_utf8(bytes) {
        Ok(_) => None,
        Err(_) => Some(latin1_to_string(bytes)),
    }
}

/// Decodes header bytes, repairing invalid UTF-8 via Latin-1.
pub fn decode_header_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => latin1_to_string(bytes),
    }
}

#[test]
fn test_nevra() {
    let mut info = RpmPackageInfo {
        name: "bash".to_owned(),
        epoch: None,
        version: "5.1.8".to_owned(),
        release: "2.fc35".to_owned(),
        arch: "x86_64".to_owned(),
        source_rpm: String::new(),
        build_time: 0,
        build_host: String::new(),
        summary: String::new(),
        description: String::new(),
        license: String::new(),
        group: String::new(),
        hash: String::new(),
        kind: PackageKind::Binary,
    };
    assert_eq!(info.nevra(), "bash-5.1.8-2.fc35.x86_64");
    info.epoch = Some(2);
    assert_eq!(info.nevra(), "bash-2:5.1.8-2.fc35.x86_64");
}

#[test]
fn test_latin1_repair() {
    assert_eq!(repair_utf8(b"GPLv2"), None);
    assert_eq!(repair_utf8(b"caf\xe9"), Some("caf\u{e9}".to_owned()));
    assert_eq!(decode_header_string(b"caf\xc3\xa9"), "café");
}

#[test]
fn test_mode_bits() {
    let mut info = RpmFileInfo {
        name: "/usr".to_owned(),
        user: "root".to_owned(),
        group: "root".to_owned(),
        mtime: 0,
        mode: 0o040755,
        flags: 0,
        ino: 1,
        nlinks: 1,
        digest: Checksum::empty_sha256(),
    };
    assert!(info.is_directory());
    info.mode = 0o120777;
    assert!(info.is_symlink());
    info.mode = 0o100755;
    assert!(!info.is_directory() && !info.is_symlink());
    info.flags = RPMFILE_GHOST;
    assert!(info.ghost());
}
