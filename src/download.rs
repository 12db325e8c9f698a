use anyhow::{bail, Context, Result};
use slog_scope::debug;

use crate::db::Database;
use crate::fetch;

/// How the database URL cache participates in a download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    /// Bypass the cache entirely and do not store the result.
    NoCache,
    /// Use the cached entry only when its length and modification time
    /// still match the server's.
    CheckCache,
    /// Use any cached entry; fetch and store on a miss.
    AlwaysCache,
    /// Never touch the network.
    OnlyCache,
}

#[derive(Clone, Copy, Debug)]
pub struct DownloadOptions {
    pub cache_mode: CacheMode,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::CheckCache,
        }
    }
}

/// Downloads URL according to the cache policy and returns the body.
/// Network fetches (except `NoCache`) update the URL cache once the body
/// has arrived completely.
pub fn download(opts: DownloadOptions, db: &Database, url: &str) -> Result<Vec<u8>> {
    match opts.cache_mode {
        CacheMode::OnlyCache | CacheMode::AlwaysCache => {
            if let Some(data) = db.url_cache_fetch(url)? {
                debug!("using cached data for {}", url);
                return Ok(data);
            }
            if opts.cache_mode == CacheMode::OnlyCache {
                bail!("URL not in cache and network access disabled: {}", url);
            }
            fetch_and_store(db, url)
        }
        CacheMode::NoCache => {
            let mut data = Vec::new();
            fetch::http_get(url, &mut data).with_context(|| format!("download of {}", url))?;
            Ok(data)
        }
        CacheMode::CheckCache => {
            let head = fetch::http_head(url).with_context(|| format!("download of {}", url))?;
            if let (Some(time), Some(length)) = (head.last_modified, head.content_length) {
                if let Some(data) = db.url_cache_fetch_checked(url, length, time)? {
                    debug!("cached data for {} is still current", url);
                    return Ok(data);
                }
            }
            fetch_and_store(db, url)
        }
    }
}

fn fetch_and_store(db: &Database, url: &str) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let meta = fetch::http_get(url, &mut data).with_context(|| format!("download of {}", url))?;
    db.url_cache_update(url, &data, meta.last_modified.unwrap_or(0))?;
    Ok(data)
}
