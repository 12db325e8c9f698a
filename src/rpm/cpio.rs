use anyhow::{bail, Result};

/// Length of the magic that selects the CPIO variant.
pub const MAGIC_SIZE: usize = 6;

/// Fixed part of a "newc"/"crc" header after the magic: thirteen 8-digit
/// hexadecimal fields.
pub const NEWC_HEADER_SIZE: usize = 104;

pub const TRAILER: &str = "TRAILER!!!";

/// Decoded CPIO entry header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpioEntry {
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub filesize: u32,
    pub devmajor: u32,
    pub devminor: u32,
    pub rdevmajor: u32,
    pub rdevminor: u32,
    pub namesize: u32,
    pub check: u32,
}

/// Header length (excluding the magic) for the given magic, or an error
/// for unknown CPIO variants. `070701` is "newc", `070702` is "crc"; the
/// two share the header layout.
pub fn header_length(magic: &[u8; MAGIC_SIZE]) -> Result<usize> {
    match magic {
        b"070701" | b"070702" => Ok(NEWC_HEADER_SIZE),
        _ => bail!("unknown cpio version"),
    }
}

fn hex_field(buf: &[u8], index: usize, name: &'static str) -> Result<u32> {
    let field = &buf[index * 8..index * 8 + 8];
    let mut value: u32 = 0;
    for &b in field {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => bail!("malformed cpio header field: {}", name),
        };
        value = value << 4 | u32::from(digit);
    }
    Ok(value)
}

/// Parses the fixed header that follows the magic.
pub fn parse(buf: &[u8]) -> Result<CpioEntry> {
    if buf.len() != NEWC_HEADER_SIZE {
        bail!("truncated cpio header");
    }
    let r = CpioEntry {
        ino: hex_field(buf, 0, "ino")?,
        mode: hex_field(buf, 1, "mode")?,
        uid: hex_field(buf, 2, "uid")?,
        gid: hex_field(buf, 3, "gid")?,
        nlink: hex_field(buf, 4, "nlink")?,
        mtime: hex_field(buf, 5, "mtime")?,
        filesize: hex_field(buf, 6, "filesize")?,
        devmajor: hex_field(buf, 7, "devmajor")?,
        devminor: hex_field(buf, 8, "devminor")?,
        rdevmajor: hex_field(buf, 9, "rdevmajor")?,
        rdevminor: hex_field(buf, 10, "rdevminor")?,
        namesize: hex_field(buf, 11, "namesize")?,
        check: hex_field(buf, 12, "check")?,
    };
    Ok(r)
}

/// Encodes one entry for the test fixtures used by the payload reader.
#[cfg(test)]
pub fn encode(entry: &CpioEntry, name: &str, contents: &[u8], crc: bool) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(if crc { b"070702" } else { b"070701" });
    for value in [
        entry.ino,
        entry.mode,
        entry.uid,
        entry.gid,
        entry.nlink,
        entry.mtime,
        contents.len() as u32,
        entry.devmajor,
        entry.devminor,
        entry.rdevmajor,
        entry.rdevminor,
        name.len() as u32 + 1,
        entry.check,
    ] {
        out.extend_from_slice(format!("{:08x}", value).as_bytes());
    }
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out.extend_from_slice(contents);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let entry = CpioEntry {
            ino: 42,
            mode: 0o100755,
            nlink: 1,
            mtime: 1234,
            ..Default::default()
        };
        let encoded = encode(&entry, "usr/bin/x", b"hi", false);
        assert_eq!(&encoded[..6], b"070701");
        let decoded = parse(&encoded[6..6 + NEWC_HEADER_SIZE]).unwrap();
        assert_eq!(decoded.ino, 42);
        assert_eq!(decoded.mode, 0o100755);
        assert_eq!(decoded.filesize, 2);
        assert_eq!(decoded.namesize, 10);
    }

    #[test]
    fn test_bad_hex() {
        let mut buf = vec![b'0'; NEWC_HEADER_SIZE];
        buf[9] = b'g';
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn test_magic() {
        assert!(header_length(b"070701").is_ok());
        assert!(header_length(b"070702").is_ok());
        assert!(header_length(b"070707").is_err());
    }
}
