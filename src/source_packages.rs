use std::collections::BTreeSet;
use std::io::BufReader;
use std::sync::Mutex;

use anyhow::{bail, Result};
use slog_scope::error;

use crate::db::Database;
use crate::repomd::{Primary, Repomd};
use crate::AppContext;

lazy_static::lazy_static! {
    // name-version-release, the last two segments dash-free.
    static ref SOURCE_RPM_RE: regex::Regex =
        regex::Regex::new("^(.+)-[^-]+-[^-]+$").unwrap();
}

/// Strips version, release and arch suffix from a source RPM file name.
fn source_package_name(source_rpm: &str) -> Option<String> {
    SOURCE_RPM_RE
        .captures(source_rpm)
        .map(|captures| captures[1].to_owned())
}

/// Prints the sorted, deduplicated source package names behind the
/// given repositories, one repository reader thread each.
pub fn show_source_packages(ctx: &AppContext, base_urls: &[String]) -> Result<()> {
    let packages: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

    std::thread::scope(|scope| {
        for base_url in base_urls {
            let packages = &packages;
            scope.spawn(move || {
                let scan = || -> Result<()> {
                    let db = Database::connect(&ctx.conninfo)?;
                    let rp = Repomd::acquire(ctx.download(), &db, base_url)?;
                    let primary_xml = rp.primary_xml(ctx.download_always_cache(), &db)?;
                    let mut primary = Primary::new(BufReader::new(primary_xml), &rp.base_url);
                    let mut names = BTreeSet::new();
                    while let Some(package) = primary.next()? {
                        match source_package_name(&package.info.source_rpm) {
                            Some(name) => {
                                names.insert(name);
                            }
                            None => bail!(
                                "malformed source RPM element: {:?}",
                                package.info.source_rpm
                            ),
                        }
                    }
                    packages.lock().unwrap().extend(names);
                    Ok(())
                };
                if let Err(err) = scan() {
                    error!("repository {}: {:#}", base_url, err);
                }
            });
        }
    });

    for name in packages.into_inner().unwrap() {
        println!("{}", name);
    }
    Ok(())
}

#[test]
fn test_source_package_name() {
    assert_eq!(
        source_package_name("foo-1.0-1.src.rpm"),
        Some("foo".to_owned())
    );
    assert_eq!(
        source_package_name("libxml2-2.9.14-3.fc37.src.rpm"),
        Some("libxml2".to_owned())
    );
    assert_eq!(
        source_package_name("name-with-dashes-1.0-1.src.rpm"),
        Some("name-with-dashes".to_owned())
    );
    assert_eq!(source_package_name("mangled"), None);
    assert_eq!(source_package_name(""), None);
}
