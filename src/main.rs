use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use slog::{o, Drain};
use slog_scope::error;

mod cache;
mod checksum;
mod closure;
mod config;
mod consolidator;
mod db;
mod download;
mod driver;
mod elf;
mod expire;
mod fetch;
mod hardlink;
mod java;
mod load;
mod python;
mod repomd;
mod rpm;
mod source_packages;
mod vercmp;

use crate::cache::FileCache;
use crate::consolidator::PackageSetConsolidator;
use crate::db::{Database, PackageId, PACKAGE_SET_LOCK_TAG};
use crate::download::{CacheMode, DownloadOptions};

const CONFIG_DEFAULT_PATH: &str = "/etc/symboldb.yaml";

/// Resolved runtime settings, config file merged with the command line.
pub struct AppContext {
    pub conninfo: String,
    pub cache_path: PathBuf,
    pub fsync_cache: bool,
    pub no_net: bool,
    pub randomize: bool,
    pub ignore_download_errors: bool,
    pub download_threads: usize,
    pub exclude: Option<regex::Regex>,
}

impl AppContext {
    pub fn connect(&self) -> Result<Database> {
        Database::connect(&self.conninfo)
    }

    pub fn download(&self) -> DownloadOptions {
        let mut opts = DownloadOptions::default();
        if self.no_net {
            opts.cache_mode = CacheMode::OnlyCache;
        }
        opts
    }

    /// Metadata URLs usually embed hashes, so the cache does not have to
    /// be checked for staleness. --no-net still overrides this.
    pub fn download_always_cache(&self) -> DownloadOptions {
        let mut opts = DownloadOptions::default();
        opts.cache_mode = if self.no_net {
            CacheMode::OnlyCache
        } else {
            CacheMode::AlwaysCache
        };
        opts
    }

    pub fn rpm_cache(&self) -> Result<FileCache> {
        let mut cache = FileCache::open(&self.cache_path.join("rpms"))?;
        cache.set_fsync(self.fsync_cache);
        Ok(cache)
    }
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum DumpFormat {
    Yaml,
    Xml,
}

impl DumpFormat {
    pub fn dump<T>(&self, v: &T) -> Result<String>
    where
        T: serde::Serialize,
    {
        let r = match self {
            DumpFormat::Yaml => serde_yaml::to_string(v)?,
            DumpFormat::Xml => quick_xml::se::to_string(v)?,
        };
        Ok(r)
    }
}

impl fmt::Display for DumpFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn load_rpms(
    db: &Database,
    files: &[PathBuf],
    ids: &mut PackageSetConsolidator<PackageId>,
) -> Result<()> {
    for file in files {
        let (pkg, info) = load::rpm_load(db, file, None, None)?;
        ids.add(&info, pkg);
    }
    Ok(())
}

fn finish_txn(db: &Database, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => db.txn_commit(),
        Err(err) => {
            let _ = db.txn_rollback();
            Err(err)
        }
    }
}

/// Create the database schema
#[derive(Args)]
struct CmdCreateSchema {}

impl CmdCreateSchema {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        ctx.connect()?.create_schema()
    }
}

/// Load RPM files into the database
#[derive(Args)]
struct CmdLoadRpm {
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl CmdLoadRpm {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        let db = ctx.connect()?;
        let mut ignored = PackageSetConsolidator::new();
        load_rpms(&db, &self.files, &mut ignored)
    }
}

/// Load RPM files and record them as a new package set
#[derive(Args)]
struct CmdCreateSet {
    name: String,
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl CmdCreateSet {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        let db = ctx.connect()?;
        if db.lookup_package_set(&self.name)?.is_some() {
            bail!("package set \"{}\" already exists", self.name);
        }
        let mut psc = PackageSetConsolidator::new();
        load_rpms(&db, &self.files, &mut psc)?;
        let ids: BTreeSet<PackageId> = psc.values().into_iter().collect();

        db.txn_begin()?;
        let result = (|| -> Result<()> {
            let set = db.create_package_set(&self.name)?;
            if db.update_package_set(set, &ids)? {
                closure::update_package_set_caches(&db, set)?;
            }
            Ok(())
        })();
        finish_txn(&db, result)
    }
}

/// Load RPM files and replace a package set's membership
#[derive(Args)]
struct CmdUpdateSet {
    name: String,
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl CmdUpdateSet {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        let db = ctx.connect()?;
        let set = match db.lookup_package_set(&self.name)? {
            Some(set) => set,
            None => bail!("package set \"{}\" does not exist", self.name),
        };
        let mut psc = PackageSetConsolidator::new();
        load_rpms(&db, &self.files, &mut psc)?;
        let ids: BTreeSet<PackageId> = psc.values().into_iter().collect();

        db.txn_begin()?;
        let result = (|| -> Result<()> {
            let _lock = db.lock(PACKAGE_SET_LOCK_TAG, set.0)?;
            if db.update_package_set(set, &ids)? {
                closure::update_package_set_caches(&db, set)?;
            }
            Ok(())
        })();
        finish_txn(&db, result)
    }
}

/// Ingest repositories and replace a package set's membership
#[derive(Args)]
struct CmdUpdateSetFromRepo {
    name: String,
    #[arg(required = true)]
    urls: Vec<String>,
}

impl CmdUpdateSetFromRepo {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        let db = ctx.connect()?;
        driver::download_repo(ctx, &db, &self.urls, true, Some(&self.name))
    }
}

/// Fetch a URL through the cache policy and write the body to stdout
#[derive(Args)]
struct CmdDownload {
    url: String,
}

impl CmdDownload {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        let db = ctx.connect()?;
        let data = download::download(ctx.download(), &db, &self.url)?;
        std::io::stdout().lock().write_all(&data)?;
        Ok(())
    }
}

/// Print the parsed repomd.xml of a repository
#[derive(Args)]
struct CmdShowRepomd {
    url: String,
}

impl CmdShowRepomd {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        let db = ctx.connect()?;
        let rp = repomd::Repomd::acquire(ctx.download(), &db, &self.url)?;
        println!("revision: {}", rp.revision);
        for entry in &rp.entries {
            let entry_url = repomd::url_combine_yum(&rp.base_url, &entry.href)?;
            println!("entry: {} {}", entry.type_, entry_url);
        }
        Ok(())
    }
}

/// Write the decompressed primary.xml of a repository to stdout
#[derive(Args)]
struct CmdShowPrimary {
    url: String,
}

impl CmdShowPrimary {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        let db = ctx.connect()?;
        let rp = repomd::Repomd::acquire(ctx.download(), &db, &self.url)?;
        let mut primary = rp.primary_xml(ctx.download_always_cache(), &db)?;
        std::io::copy(&mut primary, &mut std::io::stdout().lock())?;
        Ok(())
    }
}

/// Download the RPMs of repositories into the cache
#[derive(Args)]
struct CmdDownloadRepo {
    #[arg(required = true)]
    urls: Vec<String>,
}

impl CmdDownloadRepo {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        let db = ctx.connect()?;
        driver::download_repo(ctx, &db, &self.urls, false, None)
    }
}

/// Download and load the RPMs of repositories
#[derive(Args)]
struct CmdLoadRepo {
    #[arg(required = true)]
    urls: Vec<String>,
}

impl CmdLoadRepo {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        let db = ctx.connect()?;
        driver::download_repo(ctx, &db, &self.urls, true, None)
    }
}

#[derive(Serialize)]
#[serde(rename = "rpm")]
struct RpmDump {
    nevra: String,
    package: rpm::RpmPackageInfo,
    dependencies: Vec<rpm::RpmDependency>,
    scripts: Vec<rpm::RpmScript>,
    triggers: Vec<rpm::RpmTrigger>,
    files: Vec<rpm::RpmFileInfo>,
}

/// Dump the metadata of a single RPM file
#[derive(Args)]
struct CmdShowRpm {
    #[arg(short, long, default_value_t = DumpFormat::Yaml, value_enum)]
    format: DumpFormat,
    file: PathBuf,
}

impl CmdShowRpm {
    fn run(&self, _ctx: &AppContext) -> Result<()> {
        let parser = rpm::parser::RpmParser::open(&self.file)?;
        let dump = RpmDump {
            nevra: parser.nevra(),
            package: parser.package().clone(),
            dependencies: parser.dependencies().to_vec(),
            scripts: parser.scripts(),
            triggers: parser.triggers()?,
            files: parser.file_infos(),
        };
        let s = self.format.dump(&dump)?;
        println!("{}", s);
        Ok(())
    }
}

/// Print the source package names behind repositories
#[derive(Args)]
struct CmdShowSourcePackages {
    #[arg(required = true)]
    urls: Vec<String>,
}

impl CmdShowSourcePackages {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        source_packages::show_source_packages(ctx, &self.urls)
    }
}

/// List cached RPM digests no longer referenced by the database
#[derive(Args)]
struct CmdShowStaleCachedRpms {}

impl CmdShowStaleCachedRpms {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        let db = ctx.connect()?;
        let cache = ctx.rpm_cache()?;
        for (_algorithm, digest) in expire::stale_cached_digests(&db, &cache)? {
            println!("{}", hex::encode(digest));
        }
        Ok(())
    }
}

/// Report soname resolution conflicts recorded for a package set
#[derive(Args)]
struct CmdShowSonameConflicts {
    set: String,
}

impl CmdShowSonameConflicts {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        let db = ctx.connect()?;
        let set = match db.lookup_package_set(&self.set)? {
            Some(set) => set,
            None => bail!("invalid package set: {}", self.set),
        };
        closure::print_elf_soname_conflicts(&db, set)
    }
}

/// Remove expired cache entries and unreferenced rows
#[derive(Args)]
struct CmdExpire {}

impl CmdExpire {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        let db = ctx.connect()?;
        let cache = ctx.rpm_cache()?;
        expire::expire(&db, &cache)
    }
}

#[derive(Subcommand)]
enum CommandLine {
    CreateSchema(CmdCreateSchema),
    LoadRpm(CmdLoadRpm),
    CreateSet(CmdCreateSet),
    UpdateSet(CmdUpdateSet),
    UpdateSetFromRepo(CmdUpdateSetFromRepo),
    Download(CmdDownload),
    ShowRepomd(CmdShowRepomd),
    ShowPrimary(CmdShowPrimary),
    DownloadRepo(CmdDownloadRepo),
    LoadRepo(CmdLoadRepo),
    ShowRpm(CmdShowRpm),
    ShowSourcePackages(CmdShowSourcePackages),
    ShowStaleCachedRpms(CmdShowStaleCachedRpms),
    ShowSonameConflicts(CmdShowSonameConflicts),
    Expire(CmdExpire),
}

impl CommandLine {
    fn run(&self, ctx: &AppContext) -> Result<()> {
        match self {
            CommandLine::CreateSchema(v) => v.run(ctx),
            CommandLine::LoadRpm(v) => v.run(ctx),
            CommandLine::CreateSet(v) => v.run(ctx),
            CommandLine::UpdateSet(v) => v.run(ctx),
            CommandLine::UpdateSetFromRepo(v) => v.run(ctx),
            CommandLine::Download(v) => v.run(ctx),
            CommandLine::ShowRepomd(v) => v.run(ctx),
            CommandLine::ShowPrimary(v) => v.run(ctx),
            CommandLine::DownloadRepo(v) => v.run(ctx),
            CommandLine::LoadRepo(v) => v.run(ctx),
            CommandLine::ShowRpm(v) => v.run(ctx),
            CommandLine::ShowSourcePackages(v) => v.run(ctx),
            CommandLine::ShowStaleCachedRpms(v) => v.run(ctx),
            CommandLine::ShowSonameConflicts(v) => v.run(ctx),
            CommandLine::Expire(v) => v.run(ctx),
        }
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Application {
    /// Path to configuration file
    #[clap(short, default_value = CONFIG_DEFAULT_PATH)]
    config_path: String,
    /// Path to the download cache (default: ~/.cache/symboldb)
    #[clap(short = 'C', long)]
    cache: Option<PathBuf>,
    /// Disable most network access
    #[clap(short = 'N', long)]
    no_net: bool,
    /// Perform downloads in random order
    #[clap(long)]
    randomize: bool,
    /// Exclude packages whose name matches REGEXP (repeatable)
    #[clap(long, value_name = "REGEXP")]
    exclude_name: Vec<String>,
    /// Process repositories even when downloads failed
    #[clap(long)]
    ignore_download_errors: bool,
    /// Do not fsync RPMs downloaded into the cache
    #[clap(long)]
    transient_rpms: bool,
    /// Number of concurrent downloads
    #[clap(long, value_name = "N")]
    download_threads: Option<usize>,
    /// Less output
    #[clap(short, long)]
    quiet: bool,
    /// More verbose output
    #[clap(short, long)]
    verbose: bool,
    /// Subcommand
    #[clap(subcommand)]
    command: CommandLine,
}

impl Application {
    fn init_term_logger(log_level: slog::Level) -> slog_scope::GlobalLoggerGuard {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build();
        let drain = std::sync::Mutex::new(drain).fuse();
        let drain = slog::LevelFilter::new(drain, log_level).fuse();
        let logger = slog::Logger::root(drain, o!());
        slog_scope::set_global_logger(logger)
    }

    fn init_env_logger() -> Result<slog_scope::GlobalLoggerGuard> {
        Ok(slog_envlogger::init()?)
    }

    fn init_logger(&self, config: &config::Config) -> Result<slog_scope::GlobalLoggerGuard> {
        if std::env::var("RUST_LOG").is_ok() {
            Self::init_env_logger()
        } else {
            let level = if self.quiet {
                slog::Level::Warning
            } else if self.verbose {
                slog::Level::Debug
            } else {
                config.log_level.into()
            };
            Ok(Self::init_term_logger(level))
        }
    }

    /// Merges config file and command line. Pattern problems are usage
    /// errors.
    fn context(&self, config: config::Config) -> Result<AppContext> {
        let mut patterns: Vec<String> = Vec::new();
        for pattern in &self.exclude_name {
            regex::Regex::new(pattern)
                .with_context(|| format!("invalid --exclude-name regexp {:?}", pattern))?;
            patterns.push(format!("({})", pattern));
        }
        if let Some(configured) = &config.exclude_name {
            patterns.push(format!("({})", configured.as_str()));
        }
        let exclude = if patterns.is_empty() {
            None
        } else {
            Some(regex::Regex::new(&format!("^({})$", patterns.join("|")))?)
        };

        let cache_path = match self.cache.clone().or_else(|| config.cache.clone()) {
            Some(path) => path,
            None => {
                let home =
                    std::env::var_os("HOME").context("HOME is not set and --cache is missing")?;
                PathBuf::from(home).join(".cache/symboldb")
            }
        };

        let r = AppContext {
            conninfo: config.database,
            cache_path,
            fsync_cache: !self.transient_rpms,
            no_net: self.no_net,
            randomize: self.randomize,
            ignore_download_errors: self.ignore_download_errors,
            download_threads: self.download_threads.unwrap_or(config.download_threads),
            exclude,
        };
        Ok(r)
    }

    pub fn run(&self) -> ExitCode {
        let config = match config::Config::load(&self.config_path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error: {:#}", err);
                return ExitCode::from(2);
            }
        };
        let _logger_guard = match self.init_logger(&config) {
            Ok(guard) => guard,
            Err(err) => {
                eprintln!("error: {:#}", err);
                return ExitCode::FAILURE;
            }
        };
        let ctx = match self.context(config) {
            Ok(ctx) => ctx,
            Err(err) => {
                eprintln!("error: {:#}", err);
                return ExitCode::from(2);
            }
        };

        if let Err(err) = self.command.run(&ctx) {
            error!("{:#}", err);
            return ExitCode::FAILURE;
        }
        ExitCode::SUCCESS
    }
}

fn main() -> ExitCode {
    Application::parse().run()
}
