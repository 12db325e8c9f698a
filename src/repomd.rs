use std::io::{BufRead, Cursor, Read};

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::{BytesStart, Event};
use serde::Deserialize;

use crate::checksum::{Checksum, HashWriter};
use crate::db::Database;
use crate::download::{self, CacheMode, DownloadOptions};
use crate::rpm::{PackageKind, RpmPackageInfo};

/// Combines a relative href with a base URL the way yum does: absolute
/// hrefs win, everything else resolves against the base.
pub fn url_combine_yum(base: &str, href: &str) -> Result<String> {
    if url::Url::parse(href).is_ok() {
        return Ok(href.to_owned());
    }
    let base = url::Url::parse(base).with_context(|| format!("malformed base URL {:?}", base))?;
    let r = base
        .join(href)
        .with_context(|| format!("cannot resolve {:?} against {}", href, base))?;
    Ok(r.to_string())
}

#[derive(Debug, Deserialize)]
struct ChecksumXml {
    #[serde(rename = "@type")]
    type_: String,
    #[serde(rename = "$value")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct LocationXml {
    #[serde(rename = "@href")]
    href: String,
}

#[derive(Debug, Deserialize)]
struct DataXml {
    #[serde(rename = "@type")]
    type_: String,
    checksum: ChecksumXml,
    #[serde(rename = "open-checksum")]
    open_checksum: Option<ChecksumXml>,
    location: LocationXml,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepomdXml {
    revision: Option<String>,
    #[serde(rename = "data", default)]
    data: Vec<DataXml>,
}

/// One `<data>` entry of repomd.xml.
#[derive(Debug)]
pub struct RepomdEntry {
    pub type_: String,
    pub compressed: bool,
    pub checksum: Checksum,
    pub open_checksum: Checksum,
    pub href: String,
}

#[derive(Debug)]
pub struct Repomd {
    pub base_url: String,
    pub revision: String,
    pub entries: Vec<RepomdEntry>,
}

/// Refuses documents carrying entity declarations; nothing in repodata
/// needs them and they are a decompression-bomb vector.
fn refuse_doctype(data: &[u8]) -> Result<()> {
    let mut reader = quick_xml::Reader::from_reader(data);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::DocType(_) => bail!("XML document type declarations are not supported"),
            Event::Eof => return Ok(()),
            _ => {}
        }
        buf.clear();
    }
}

fn parse_length(text: &Option<String>) -> Result<Option<u64>> {
    match text {
        None => Ok(None),
        Some(text) => {
            let r = text
                .trim()
                .parse::<u64>()
                .map_err(|_| anyhow!("size element malformed: {:?}", text))?;
            Ok(Some(r))
        }
    }
}

impl Repomd {
    pub fn parse(base_url: &str, data: &[u8]) -> Result<Repomd> {
        refuse_doctype(data)?;
        let xml: RepomdXml = quick_xml::de::from_reader(data).context("malformed repomd.xml")?;
        let mut entries = Vec::with_capacity(xml.data.len());
        for data in xml.data {
            let length = parse_length(&data.size)?;
            let checksum =
                Checksum::from_hex(&data.checksum.type_, length, data.checksum.value.trim())?;
            let open_checksum = match &data.open_checksum {
                Some(open) => Checksum::from_hex(&open.type_, None, open.value.trim())?,
                None => checksum.clone(),
            };
            if data.location.href.is_empty() {
                bail!("malformed location element in repomd.xml");
            }
            entries.push(RepomdEntry {
                type_: data.type_,
                compressed: data.open_checksum.is_some(),
                checksum,
                open_checksum,
                href: data.location.href,
            });
        }
        let r = Repomd {
            base_url: base_url.to_owned(),
            revision: xml.revision.unwrap_or_default(),
            entries,
        };
        Ok(r)
    }

    /// Fetches and parses `<base>/repodata/repomd.xml`.
    pub fn acquire(opts: DownloadOptions, db: &Database, url: &str) -> Result<Repomd> {
        let mut base = url.to_owned();
        if !base.ends_with('/') {
            base.push('/');
        }
        let mdurl = format!("{}repodata/repomd.xml", base);
        let data = download::download(opts, db, &mdurl)?;
        if data.is_empty() {
            bail!("empty document at {}", mdurl);
        }
        Repomd::parse(&base, &data).with_context(|| format!("repository {}", url))
    }

    /// Opens the decompressed primary.xml stream. The compressed bytes
    /// are usually served under a digest-embedding name, in which case a
    /// cache hit is known to be current; otherwise the cache entry is
    /// revalidated against the server.
    pub fn primary_xml(&self, opts: DownloadOptions, db: &Database) -> Result<PrimaryXml> {
        for entry in &self.entries {
            if entry.type_ != "primary" || !entry.href.ends_with(".xml.gz") {
                continue;
            }
            let mut opts = opts;
            let digest = entry.checksum.hex();
            if !entry.href.contains(&digest) && opts.cache_mode == CacheMode::AlwaysCache {
                opts.cache_mode = CacheMode::CheckCache;
            }
            let entry_url = url_combine_yum(&self.base_url, &entry.href)?;
            let compressed = download::download(opts, db, &entry_url)?;
            return Ok(PrimaryXml::new(entry_url, compressed, entry.checksum.clone()));
        }
        bail!("{}: could not find primary.xml", self.base_url);
    }
}

struct HashingReader {
    inner: Cursor<Vec<u8>>,
    hasher: Option<HashWriter>,
}

impl Read for HashingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Some(hasher) = &mut self.hasher {
                hasher.update(&buf[..n]);
            }
        }
        Ok(n)
    }
}

/// Decompressed view of primary.xml. The digest of the *compressed*
/// stream is validated once the decompressor reaches end of stream;
/// a mismatch surfaces as a read error.
pub struct PrimaryXml {
    url: String,
    decoder: flate2::read::GzDecoder<HashingReader>,
    expected: Checksum,
    verified: bool,
}

impl PrimaryXml {
    pub fn new(url: String, compressed: Vec<u8>, expected: Checksum) -> Self {
        let reader = HashingReader {
            inner: Cursor::new(compressed),
            hasher: Some(HashWriter::new(expected.algorithm)),
        };
        Self {
            url,
            decoder: flate2::read::GzDecoder::new(reader),
            expected,
            verified: false,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn verify(&mut self) -> std::io::Result<()> {
        let inner = self.decoder.get_mut();
        // Hash any compressed bytes the decompressor did not consume.
        std::io::copy(inner, &mut std::io::sink())?;
        let digest = match inner.hasher.take() {
            Some(hasher) => hasher.finish(),
            None => return Ok(()),
        };
        if digest != self.expected.value {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "compressed data does not match {} checksum (actual {}, expected {})",
                    self.expected.algorithm,
                    hex::encode(digest),
                    self.expected.hex()
                ),
            ));
        }
        Ok(())
    }
}

impl Read for PrimaryXml {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.decoder.read(buf)?;
        if n == 0 && !self.verified {
            self.verified = true;
            self.verify()?;
        }
        Ok(n)
    }
}

/// One `<package>` descriptor from primary.xml.
#[derive(Debug)]
pub struct PrimaryPackage {
    /// Header fields as listed in the metadata; the header hash is not
    /// part of primary.xml and stays empty.
    pub info: RpmPackageInfo,
    /// Absolute download URL.
    pub href: String,
    /// Digest of the RPM file representation.
    pub checksum: Checksum,
}

/// Pull parser over a primary.xml stream, yielding one descriptor per
/// `<package>` element.
pub struct Primary<R: BufRead> {
    reader: quick_xml::Reader<R>,
    base_url: String,
    buf: Vec<u8>,
}

#[derive(Default)]
struct PackageFields {
    name: String,
    arch: String,
    epoch: Option<i32>,
    version: String,
    release: String,
    summary: String,
    description: String,
    license: String,
    group: String,
    build_host: String,
    build_time: i64,
    source_rpm: String,
    checksum_type: String,
    checksum_value: String,
    length: Option<u64>,
    href: String,
    location_base: Option<String>,
}

fn attribute(start: &BytesStart, name: &[u8]) -> Result<Option<String>> {
    for attr in start.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

impl<R: BufRead> Primary<R> {
    pub fn new(source: R, base_url: &str) -> Self {
        let mut reader = quick_xml::Reader::from_reader(source);
        reader.trim_text(true);
        Self {
            reader,
            base_url: base_url.to_owned(),
            buf: Vec::new(),
        }
    }

    /// Returns the next package descriptor, or `None` at the end of the
    /// metadata.
    pub fn next(&mut self) -> Result<Option<PrimaryPackage>> {
        loop {
            self.buf.clear();
            let package_start = match self.reader.read_event_into(&mut self.buf)? {
                Event::DocType(_) => {
                    bail!("XML document type declarations are not supported")
                }
                Event::Start(start) => start.name().as_ref() == b"package",
                Event::Eof => return Ok(None),
                _ => false,
            };
            if package_start {
                return Ok(Some(self.parse_package()?));
            }
        }
    }

    fn parse_package(&mut self) -> Result<PrimaryPackage> {
        let mut fields = PackageFields::default();
        // Path of open elements below <package>; text is routed by the
        // innermost element name.
        let mut path: Vec<Vec<u8>> = Vec::new();
        loop {
            self.buf.clear();
            let event = self.reader.read_event_into(&mut self.buf)?;
            match event {
                Event::Start(start) => {
                    fields.element(&start, &path)?;
                    path.push(start.name().as_ref().to_vec());
                }
                Event::Empty(start) => {
                    fields.element(&start, &path)?;
                }
                Event::End(end) => {
                    if path.pop().is_none() {
                        if end.name().as_ref() != b"package" {
                            bail!("unbalanced element in primary.xml");
                        }
                        return fields.finish(&self.base_url);
                    }
                }
                Event::Text(text) => {
                    let value = text.unescape()?;
                    fields.text(path.last().map(|v| v.as_slice()), value.trim());
                }
                Event::DocType(_) => {
                    bail!("XML document type declarations are not supported")
                }
                Event::Eof => bail!("unexpected end of primary.xml inside a package element"),
                _ => {}
            }
        }
    }
}

impl PackageFields {
    fn element(&mut self, start: &BytesStart, path: &[Vec<u8>]) -> Result<()> {
        match start.name().as_ref() {
            b"version" if path.is_empty() => {
                if let Some(epoch) = attribute(start, b"epoch")? {
                    let epoch: i64 = epoch
                        .trim()
                        .parse()
                        .map_err(|_| anyhow!("malformed epoch {:?}", epoch))?;
                    if epoch != 0 {
                        if epoch > i32::MAX as i64 || epoch < 0 {
                            bail!("epoch out of range: {}", epoch);
                        }
                        self.epoch = Some(epoch as i32);
                    }
                }
                self.version = attribute(start, b"ver")?.unwrap_or_default();
                self.release = attribute(start, b"rel")?.unwrap_or_default();
            }
            b"checksum" if path.is_empty() => {
                self.checksum_type = attribute(start, b"type")?.unwrap_or_default();
            }
            b"time" if path.is_empty() => {
                if let Some(build) = attribute(start, b"build")? {
                    self.build_time = build
                        .trim()
                        .parse()
                        .map_err(|_| anyhow!("malformed build time {:?}", build))?;
                }
            }
            b"size" if path.is_empty() => {
                if let Some(package) = attribute(start, b"package")? {
                    self.length = Some(
                        package
                            .trim()
                            .parse()
                            .map_err(|_| anyhow!("malformed package size {:?}", package))?,
                    );
                }
            }
            b"location" if path.is_empty() => {
                self.href = attribute(start, b"href")?.unwrap_or_default();
                self.location_base = attribute(start, b"xml:base")?;
            }
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, element: Option<&[u8]>, value: &str) {
        let target = match element {
            Some(b"name") => &mut self.name,
            Some(b"arch") => &mut self.arch,
            Some(b"summary") => &mut self.summary,
            Some(b"description") => &mut self.description,
            Some(b"checksum") => &mut self.checksum_value,
            Some(b"rpm:license") => &mut self.license,
            Some(b"rpm:group") => &mut self.group,
            Some(b"rpm:buildhost") => &mut self.build_host,
            Some(b"rpm:sourcerpm") => &mut self.source_rpm,
            _ => return,
        };
        *target = value.to_owned();
    }

    fn finish(self, base_url: &str) -> Result<PrimaryPackage> {
        if self.name.is_empty() {
            bail!("package element without a name");
        }
        if self.href.is_empty() {
            bail!("package element without a location");
        }
        let checksum = Checksum::from_hex(&self.checksum_type, self.length, &self.checksum_value)
            .with_context(|| format!("package {}", self.name))?;
        let base = match &self.location_base {
            Some(xml_base) => url_combine_yum(base_url, xml_base)?,
            None => base_url.to_owned(),
        };
        let href = url_combine_yum(&base, &self.href)?;
        let info = RpmPackageInfo {
            name: self.name,
            epoch: self.epoch,
            version: self.version,
            release: self.release,
            arch: self.arch,
            source_rpm: self.source_rpm,
            build_time: self.build_time,
            build_host: self.build_host,
            summary: self.summary,
            description: self.description,
            license: self.license,
            group: self.group,
            hash: String::new(),
            kind: PackageKind::Binary,
        };
        let r = PrimaryPackage {
            info,
            href,
            checksum,
        };
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{hash_bytes, HashAlgorithm};
    use std::io::Write;

    const REPOMD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <revision>1657717375</revision>
  <data type="primary">
    <checksum type="sha256">bf2a1a25d5a2ad7b85c5e375ae6a1eba55fe85e9944a3699e3a80f18039c9b53</checksum>
    <open-checksum type="sha256">aa52992cbcde3a1c38e500f51230be1a1a1094c34f4a236f9a99166b3b7cbafb</open-checksum>
    <location href="repodata/bf2a1a25-primary.xml.gz"/>
    <size> 2932 </size>
    <open-size>26214</open-size>
  </data>
  <data type="filelists">
    <checksum type="sha">bff3977e704f06e9f8ff51ee365c4ab419e91225</checksum>
    <location href="repodata/filelists.xml.gz"/>
  </data>
</repomd>"#;

    #[test]
    fn test_parse_repomd() {
        let repomd = Repomd::parse("http://repo/", REPOMD.as_bytes()).unwrap();
        assert_eq!(repomd.revision, "1657717375");
        assert_eq!(repomd.entries.len(), 2);
        let primary = &repomd.entries[0];
        assert_eq!(primary.type_, "primary");
        assert!(primary.compressed);
        assert_eq!(primary.checksum.length, Some(2932));
        assert_eq!(primary.checksum.algorithm, HashAlgorithm::Sha256);
        assert_ne!(primary.open_checksum.value, primary.checksum.value);
        let filelists = &repomd.entries[1];
        assert!(!filelists.compressed);
        assert_eq!(filelists.checksum.algorithm, HashAlgorithm::Sha1);
        assert_eq!(filelists.checksum.length, None);
        assert_eq!(filelists.open_checksum.value, filelists.checksum.value);
    }

    #[test]
    fn test_doctype_is_refused() {
        let doc = "<!DOCTYPE repomd [<!ENTITY x \"y\">]><repomd></repomd>";
        assert!(Repomd::parse("http://repo/", doc.as_bytes()).is_err());
    }

    #[test]
    fn test_url_combine() {
        assert_eq!(
            url_combine_yum("http://repo/fedora/", "repodata/primary.xml.gz").unwrap(),
            "http://repo/fedora/repodata/primary.xml.gz"
        );
        assert_eq!(
            url_combine_yum("http://repo/fedora/", "http://mirror/p.rpm").unwrap(),
            "http://mirror/p.rpm"
        );
        assert_eq!(
            url_combine_yum("http://repo/fedora/", "../updates/x.rpm").unwrap(),
            "http://repo/updates/x.rpm"
        );
    }

    const PRIMARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" xmlns:rpm="http://linux.duke.edu/metadata/rpm" packages="2">
<package type="rpm">
  <name>hello</name>
  <arch>x86_64</arch>
  <version epoch="0" ver="1.0" rel="1"/>
  <checksum type="sha256" pkgid="YES">b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9</checksum>
  <summary>Hello</summary>
  <description>Hello, world</description>
  <time file="1657717375" build="1650000000"/>
  <size package="2048" installed="4096" archive="4200"/>
  <location href="packages/hello-1.0-1.x86_64.rpm"/>
  <format>
    <rpm:license>MIT</rpm:license>
    <rpm:group>Development/Tools</rpm:group>
    <rpm:buildhost>builder</rpm:buildhost>
    <rpm:sourcerpm>hello-1.0-1.src.rpm</rpm:sourcerpm>
  </format>
</package>
<package type="rpm">
  <name>libfoo</name>
  <arch>i686</arch>
  <version epoch="2" ver="0.5" rel="3"/>
  <checksum type="sha">bff3977e704f06e9f8ff51ee365c4ab419e91225</checksum>
  <summary/>
  <description/>
  <time file="1" build="2"/>
  <location xml:base="http://elsewhere/pool/" href="libfoo.rpm"/>
  <format>
    <rpm:sourcerpm>foo-0.5-3.src.rpm</rpm:sourcerpm>
  </format>
</package>
</metadata>"#;

    #[test]
    fn test_primary_pull_parser() {
        let mut primary = Primary::new(PRIMARY.as_bytes(), "http://repo/fedora/");

        let first = primary.next().unwrap().unwrap();
        assert_eq!(first.info.name, "hello");
        assert_eq!(first.info.arch, "x86_64");
        assert_eq!(first.info.epoch, None);
        assert_eq!(first.info.version, "1.0");
        assert_eq!(first.info.source_rpm, "hello-1.0-1.src.rpm");
        assert_eq!(first.info.license, "MIT");
        assert_eq!(first.info.build_time, 1650000000);
        assert_eq!(first.info.hash, "");
        assert_eq!(first.href, "http://repo/fedora/packages/hello-1.0-1.x86_64.rpm");
        assert_eq!(first.checksum.length, Some(2048));
        assert_eq!(first.checksum.algorithm, HashAlgorithm::Sha256);

        let second = primary.next().unwrap().unwrap();
        assert_eq!(second.info.epoch, Some(2));
        assert_eq!(second.checksum.length, None);
        assert_eq!(second.href, "http://elsewhere/pool/libfoo.rpm");

        assert!(primary.next().unwrap().is_none());
    }

    #[test]
    fn test_primary_xml_digest_verification() {
        let body = b"<metadata></metadata>";
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(body).unwrap();
        let compressed = encoder.finish().unwrap();

        let good = Checksum {
            algorithm: HashAlgorithm::Sha256,
            value: hash_bytes(HashAlgorithm::Sha256, &compressed),
            length: None,
        };
        let mut stream =
            PrimaryXml::new("http://x".to_owned(), compressed.clone(), good);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, body);

        let bad = Checksum {
            algorithm: HashAlgorithm::Sha256,
            value: vec![0; 32],
            length: None,
        };
        let mut stream = PrimaryXml::new("http://x".to_owned(), compressed, bad);
        let mut out = Vec::new();
        assert!(stream.read_to_end(&mut out).is_err());
    }
}
