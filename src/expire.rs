use anyhow::Result;
use slog_scope::info;

use crate::cache::FileCache;
use crate::checksum::HashAlgorithm;
use crate::db::Database;

/// Cached RPM digests that no package representation references any
/// longer, i.e. deletion candidates.
pub fn stale_cached_digests(
    db: &Database,
    cache: &FileCache,
) -> Result<Vec<(HashAlgorithm, Vec<u8>)>> {
    let referenced = db.referenced_package_digests()?;
    let mut stale = cache.digests()?;
    stale.retain(|(_, digest)| referenced.binary_search(digest).is_err());
    stale.sort();
    Ok(stale)
}

/// Removes expired URL-cache rows, unreferenced packages, contents and
/// Java classes, and cached RPMs whose digest is no longer referenced.
pub fn expire(db: &Database, cache: &FileCache) -> Result<()> {
    info!("expiring URL cache");
    db.expire_url_cache()?;

    info!("expiring unreferenced packages");
    db.expire_packages()?;

    info!("expiring file contents");
    db.expire_file_contents()?;

    info!("expiring java classes");
    db.expire_java_classes()?;

    info!("expiring unused RPMs");
    for (algorithm, digest) in stale_cached_digests(db, cache)? {
        cache.remove(algorithm, &digest)?;
    }
    Ok(())
}
