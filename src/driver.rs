use std::collections::BTreeSet;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Result};
use crossbeam_channel::Sender;
use rand::seq::SliceRandom;
use slog_scope::{debug, error, info, warn};

use crate::cache::FileCache;
use crate::checksum::Checksum;
use crate::closure;
use crate::consolidator::PackageSetConsolidator;
use crate::db::{Database, PackageId, PackageSetId, PACKAGE_SET_LOCK_TAG};
use crate::fetch;
use crate::load;
use crate::repomd::{Primary, Repomd};
use crate::AppContext;

#[derive(Clone, Debug)]
struct RpmUrl {
    name: String,
    href: String,
    csum: Checksum,
}

#[derive(Debug)]
struct LoadInfo {
    path: PathBuf,
    csum: Checksum,
    href: String,
}

struct Shared {
    work: Mutex<Vec<RpmUrl>>,
    failed: Mutex<Vec<RpmUrl>>,
    pids: Mutex<BTreeSet<PackageId>>,
}

/// Ingests the given repository base URLs: enumerates their primary
/// metadata, consolidates to the newest (name, arch) instances,
/// downloads into the cache with a worker pool, optionally loads every
/// RPM, and finally replaces the target set's membership.
pub fn download_repo(
    ctx: &AppContext,
    db: &Database,
    base_urls: &[String],
    load_packages: bool,
    set_name: Option<&str>,
) -> Result<()> {
    let set = match set_name {
        Some(name) if load_packages => match db.lookup_package_set(name)? {
            Some(set) => Some(set),
            None => bail!("unknown package set: {}", name),
        },
        _ => None,
    };

    let mut pset = PackageSetConsolidator::new();
    for base_url in base_urls {
        info!("processing repository {}", base_url);
        let rp = Repomd::acquire(ctx.download(), db, base_url)?;
        let primary_xml = rp.primary_xml(ctx.download_always_cache(), db)?;
        let mut primary = Primary::new(BufReader::new(primary_xml), &rp.base_url);
        while let Some(package) = primary.next()? {
            let rpm_url = RpmUrl {
                name: package.info.name.clone(),
                href: package.href.clone(),
                csum: package.checksum.clone(),
            };
            pset.add(&package.info, rpm_url);
        }
    }

    let mut urls = pset.values();
    info!("{} packages in download set", urls.len());

    if let Some(exclude) = &ctx.exclude {
        let before = urls.len();
        urls.retain(|url| !exclude.is_match(&url.name));
        info!("package name filter excluded {} packages", before - urls.len());
    }
    if ctx.randomize {
        urls.shuffle(&mut rand::thread_rng());
    }

    let start_count = urls.len();
    // The workers pop from the back of the stack.
    urls.reverse();
    let shared = Shared {
        work: Mutex::new(urls),
        failed: Mutex::new(Vec::new()),
        pids: Mutex::new(BTreeSet::new()),
    };
    let mut downloaded = 0usize;

    // Retry three times or until all URLs have been downloaded.
    for _round in 0..3 {
        if shared.work.lock().unwrap().is_empty() {
            break;
        }
        let (tx, rx) = crossbeam_channel::bounded(ctx.download_threads.max(1));
        std::thread::scope(|scope| {
            for _ in 0..ctx.download_threads.max(1) {
                let tx = tx.clone();
                scope.spawn(|| download_helper(ctx, &shared, tx));
            }
            drop(tx);
            // This thread is the single loader; the pop blocks until
            // a download completes and ends when the last worker exits.
            for (_name, to_load) in rx.iter() {
                downloaded += 1;
                if load_packages {
                    match load::rpm_load(db, &to_load.path, Some(&to_load.csum), Some(&to_load.href))
                    {
                        Ok((pid, _info)) => {
                            shared.pids.lock().unwrap().insert(pid);
                        }
                        Err(err) => {
                            error!("failed to load {}: {:#}", to_load.path.display(), err);
                        }
                    }
                }
            }
        });
        {
            let mut work = shared.work.lock().unwrap();
            let mut failed = shared.failed.lock().unwrap();
            std::mem::swap(&mut *work, &mut *failed);
        }
    }

    info!("downloaded {} of {} packages", downloaded, start_count);

    let leftover = shared.work.into_inner().unwrap();
    let pids = shared.pids.into_inner().unwrap();
    let do_pset_update = load_packages && set.is_some();
    if !leftover.is_empty() {
        error!("{} packages failed download:", leftover.len());
        for url in &leftover {
            error!("  {}", url.href);
        }
        if ctx.ignore_download_errors && do_pset_update {
            if pids.is_empty() {
                bail!("no packages left in download set");
            }
            warn!("download errors ignored, continuing");
        } else {
            bail!("{} packages failed download", leftover.len());
        }
    }

    if do_pset_update {
        let set = set.unwrap();
        db.txn_begin()?;
        let result = (|| -> Result<()> {
            let _lock = db.lock(PACKAGE_SET_LOCK_TAG, set.0)?;
            if db.update_package_set(set, &pids)? {
                closure::update_package_set_caches(db, set)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => db.txn_commit()?,
            Err(err) => {
                let _ = db.txn_rollback();
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Worker thread body: pops URLs from the shared stack until it is
/// drained. Each worker uses its own database connection and cache
/// handle. Failed URLs go onto the retry list for the next round.
fn download_helper(ctx: &AppContext, shared: &Shared, tx: Sender<(String, LoadInfo)>) {
    let db = match Database::connect(&ctx.conninfo) {
        Ok(db) => db,
        Err(err) => {
            error!("download worker has no database connection: {:#}", err);
            return;
        }
    };
    let cache = match ctx.rpm_cache() {
        Ok(cache) => cache,
        Err(err) => {
            error!("download worker has no cache: {:#}", err);
            return;
        }
    };
    loop {
        let url = {
            let mut work = shared.work.lock().unwrap();
            match work.pop() {
                Some(url) => url,
                None => break,
            }
        };
        if let Err(err) = download_url(&db, &cache, shared, &tx, &url) {
            error!("download of {} failed: {:#}", url.href, err);
            shared.failed.lock().unwrap().push(url);
        }
    }
}

fn download_url(
    db: &Database,
    cache: &FileCache,
    shared: &Shared,
    tx: &Sender<(String, LoadInfo)>,
    url: &RpmUrl,
) -> Result<()> {
    // Prevents concurrent insertion of the same RPM across workers and
    // processes.
    let _lock = db.lock_digest(&url.csum.value)?;

    // Fast track: this representation is already in the database.
    if let Some(pid) = db.package_by_digest(&url.csum.value)? {
        debug!("skipping {}", url.href);
        shared.pids.lock().unwrap().insert(pid);
        return Ok(());
    }

    let path = match cache.lookup(&url.csum) {
        Some(path) => path,
        None => {
            match url.csum.length {
                Some(length) => info!("downloading {} ({} bytes)", url.href, length),
                None => info!("downloading {}", url.href),
            }
            let mut sink = cache.add(&url.csum)?;
            fetch::http_get(&url.href, &mut sink)?;
            sink.finish()?
        }
    };
    // Blocks while the queue is full; load is the bottleneck.
    let _ = tx.send((
        url.name.clone(),
        LoadInfo {
            path,
            csum: url.csum.clone(),
            href: url.href.clone(),
        },
    ));
    Ok(())
}
