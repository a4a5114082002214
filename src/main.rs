use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use treeport::cache::{CachePaths, GitCli, RepoCache};
use treeport::cli::{
    format_batch_report, format_cache_list, format_publish_report, format_size, format_status,
};
use treeport::config::{Config, default_config_path};
use treeport::descriptor::Descriptor;
use treeport::load::{BatchLoader, CancelToken, Loader};
use treeport::manifest::{ProjectMeta, load_manifest};
use treeport::publish::{PublishError, PublishOptions, PublishOutcome, Publisher, VersionChoice};
use treeport::resolve::{LatestPolicy, RefSelector};
use treeport::types::{Remote, RepoKey, SubPath};
use treeport::version::BumpKind;

type CmdResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(
    name = "treeport",
    version,
    about = "Load versioned sub-trees of git repositories, and publish tagged releases"
)]
struct Cli {
    /// Cache root (overrides config and TREEPORT_CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Config file (default: <config dir>/treeport/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load one package from a repository
    Load {
        /// Repository: domain/owner/repo or a clone URL
        repo: String,
        /// Path inside the repository
        #[arg(long)]
        path: Option<String>,
        /// Version, range (^1.2, >=1.0,<2), commit id or "latest".
        /// Without --version, --tag or --branch the default branch is loaded.
        #[arg(long, conflicts_with_all = ["tag", "branch"])]
        version: Option<String>,
        #[arg(long, conflicts_with = "branch")]
        tag: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        /// Package name (default: last path segment or repository name)
        #[arg(long)]
        name: Option<String>,
        /// Directory to load into
        #[arg(long)]
        target: Option<PathBuf>,
        /// Delete the target before loading
        #[arg(long)]
        clean: bool,
        /// Run post-load commands
        #[arg(long)]
        run_hooks: bool,
        #[arg(long, value_enum)]
        latest: Option<LatestPolicy>,
    },

    /// Load every package of a manifest
    LoadAll {
        #[arg(default_value = "pkg.json")]
        manifest: PathBuf,
        /// Only these packages (comma-separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
        #[arg(long)]
        clean: bool,
        /// Worker threads
        #[arg(short, long)]
        jobs: Option<usize>,
        #[arg(long)]
        run_hooks: bool,
        #[arg(long, value_enum)]
        latest: Option<LatestPolicy>,
    },

    /// Commit, tag and push a package
    Publish {
        #[arg(default_value = ".")]
        dir: PathBuf,
        /// Commit message
        #[arg(short, long)]
        message: Option<String>,
        #[arg(long, value_enum, conflicts_with = "version")]
        bump: Option<BumpKind>,
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        no_tag: bool,
        #[arg(long)]
        no_push: bool,
        /// Replace an existing tag
        #[arg(long)]
        force_tag: bool,
        /// Marker before the version in tag names ("" or "v")
        #[arg(long, default_value = "")]
        marker: String,
        /// Tag prefix (default: derived from pkg.json)
        #[arg(long)]
        tag_prefix: Option<String>,
        /// Copy the package into the db-repo named in its pkg.json and
        /// publish from there
        #[arg(long, conflicts_with = "tag_prefix")]
        db_repo: bool,
    },

    /// Publish every package of a manifest that has a localDir into its
    /// db-repo
    PublishAll {
        #[arg(default_value = "pkg.json")]
        manifest: PathBuf,
        /// Only these packages (comma-separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
        /// Bump instead of using each package's pkg.json version
        #[arg(long, value_enum)]
        bump: Option<BumpKind>,
        #[arg(short, long)]
        message: Option<String>,
        #[arg(long)]
        no_tag: bool,
        #[arg(long)]
        no_push: bool,
        #[arg(long)]
        force_tag: bool,
        #[arg(long, default_value = "")]
        marker: String,
    },

    /// Push HEAD and an existing tag (retry after a failed publish)
    Push {
        tag: String,
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        force: bool,
        /// Push from the db-repo work tree of the package in DIR
        #[arg(long)]
        db_repo: bool,
    },

    /// Create a version tag without committing
    Tag {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[arg(long, value_enum, conflicts_with = "version")]
        bump: Option<BumpKind>,
        #[arg(long)]
        version: Option<String>,
        /// Tag message
        #[arg(short, long)]
        message: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        push: bool,
        #[arg(long, default_value = "")]
        marker: String,
        #[arg(long)]
        tag_prefix: Option<String>,
    },

    /// Delete a tag locally and optionally on the remote
    DeleteTag {
        tag: String,
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        remote: bool,
    },

    /// Print the version the next release would get
    NextVersion {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[arg(long, value_enum, default_value_t = BumpKind::Patch)]
        bump: BumpKind,
        #[arg(long, default_value = "")]
        marker: String,
        #[arg(long)]
        tag_prefix: Option<String>,
    },

    /// Inspect or prune the repository cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Show loaded packages
    Status,

    /// Check dependencies
    Doctor,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached repositories
    List,
    /// Remove one repository's mirror
    Remove { repo: String },
    /// Remove every mirror
    Clear,
    /// Print the cache root
    Path,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match Config::resolve(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(dir) = cli.cache_dir.clone() {
                config.cache_dir = Some(dir);
            }
            run(cli.command, config)
        }
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn run(command: Commands, config: Config) -> CmdResult {
    match command {
        Commands::Load {
            repo,
            path,
            version,
            tag,
            branch,
            name,
            target,
            clean,
            run_hooks,
            latest,
        } => {
            let selector =
                RefSelector::from_flags(version.as_deref(), tag.as_deref(), branch.as_deref())?;
            cmd_load(
                config, &repo, path, selector, name, target, clean, run_hooks, latest,
            )
        }
        Commands::LoadAll {
            manifest,
            only,
            clean,
            jobs,
            run_hooks,
            latest,
        } => cmd_load_all(config, &manifest, only, clean, jobs, run_hooks, latest),
        Commands::Publish {
            dir,
            message,
            bump,
            version,
            no_tag,
            no_push,
            force_tag,
            marker,
            tag_prefix,
            db_repo,
        } => {
            let options = PublishOptions {
                message,
                commit: true,
                version: version_choice(&dir, bump, version)?,
                tag: !no_tag,
                tag_message: None,
                push: !no_push,
                force_tag,
                marker,
                tag_prefix,
            };
            if db_repo {
                cmd_publish_db_repo(&config, &dir, &options)
            } else {
                cmd_publish(&config, &dir, &options)
            }
        }
        Commands::PublishAll {
            manifest,
            only,
            bump,
            message,
            no_tag,
            no_push,
            force_tag,
            marker,
        } => {
            let options = PublishOptions {
                message,
                commit: true,
                version: bump.map_or(VersionChoice::FromMetadata, VersionChoice::Bump),
                tag: !no_tag,
                tag_message: None,
                push: !no_push,
                force_tag,
                marker,
                tag_prefix: None,
            };
            cmd_publish_all(&config, &manifest, only, &options)
        }
        Commands::Push {
            tag,
            dir,
            force,
            db_repo,
        } => cmd_push(&config, &dir, &tag, force, db_repo),
        Commands::Tag {
            dir,
            bump,
            version,
            message,
            force,
            push,
            marker,
            tag_prefix,
        } => {
            let options = PublishOptions {
                message: None,
                commit: false,
                version: version_choice(&dir, bump, version)?,
                tag: true,
                tag_message: message,
                push,
                force_tag: force,
                marker,
                tag_prefix,
            };
            cmd_publish(&config, &dir, &options)
        }
        Commands::DeleteTag { tag, dir, remote } => {
            publisher(&config).delete_tag(&dir, &tag, remote)?;
            println!("Deleted tag {}{}", tag, if remote { " (local and remote)" } else { "" });
            Ok(())
        }
        Commands::NextVersion {
            dir,
            bump,
            marker,
            tag_prefix,
        } => {
            let options = PublishOptions {
                version: VersionChoice::Bump(bump),
                marker,
                tag_prefix,
                ..PublishOptions::default()
            };
            let next = publisher(&config).next_version(&dir, &options)?;
            println!("{}", next);
            Ok(())
        }
        Commands::Cache { command } => cmd_cache(&config, command),
        Commands::Status => cmd_status(&config),
        Commands::Doctor => cmd_doctor(&config),
    }
}

/// `--version` wins, then `--bump`, then the `version` in pkg.json; with
/// neither, the patch level is bumped.
fn version_choice(
    dir: &Path,
    bump: Option<BumpKind>,
    version: Option<String>,
) -> Result<VersionChoice, Box<dyn std::error::Error>> {
    if let Some(version) = version {
        let parsed = treeport::version::parse_version_loose(&version)
            .ok_or_else(|| format!("invalid version '{}'", version))?;
        return Ok(VersionChoice::Exact(parsed));
    }
    if let Some(bump) = bump {
        return Ok(VersionChoice::Bump(bump));
    }
    let has_version = ProjectMeta::read(dir)?
        .and_then(|meta| meta.version)
        .is_some();
    Ok(if has_version {
        VersionChoice::FromMetadata
    } else {
        VersionChoice::Bump(BumpKind::Patch)
    })
}

fn open_cache(config: &Config) -> Result<Arc<RepoCache>, Box<dyn std::error::Error>> {
    let root = config.cache_root()?;
    let cache = RepoCache::open(CachePaths::new(root), config.cache_options())?;
    Ok(Arc::new(cache))
}

fn publisher(config: &Config) -> Publisher {
    Publisher::new(
        config.remote.clone(),
        config.initial_version.clone(),
        config.default_branch.clone(),
    )
    .with_git(GitCli::for_worktree().with_timeout(config.cache_options().git_timeout))
    .with_lock_timeout(config.cache_options().lock_timeout)
    .with_url_rewrites(config.url_rewrites.clone())
}

#[allow(clippy::too_many_arguments)]
fn cmd_load(
    mut config: Config,
    repo: &str,
    path: Option<String>,
    selector: RefSelector,
    name: Option<String>,
    target: Option<PathBuf>,
    clean: bool,
    run_hooks: bool,
    latest: Option<LatestPolicy>,
) -> CmdResult {
    if let Some(latest) = latest {
        config.latest = latest;
    }
    config.run_hooks |= run_hooks;

    let remote: Remote = repo
        .parse()
        .map_err(|e| format!("Invalid repository '{}': {}", repo, e))?;
    let sub_path: SubPath = path
        .as_deref()
        .unwrap_or("")
        .parse()
        .map_err(|e| format!("Invalid path: {}", e))?;
    let name = name.unwrap_or_else(|| {
        sub_path
            .file_name()
            .unwrap_or_else(|| remote.key.path.name())
            .to_string()
    });
    let mut descriptor = Descriptor::new(name, remote, selector)?.with_sub_path(sub_path);
    if let Some(target) = target {
        descriptor = descriptor.with_local_target(target);
    }

    let project_root = std::env::current_dir()?;
    let loader = Loader::new(open_cache(&config)?, config.loader_options(&project_root))
        .with_hooks(config.hooks());
    if clean {
        loader.clean_target(&descriptor)?;
    }
    let loaded = loader.load(&descriptor)?;

    println!(
        "Loaded {} {} ({}) into {}",
        descriptor.package_name,
        loaded.resolved.ref_name,
        loaded.resolved.short(),
        loaded.target.display()
    );
    println!("  Files: {}", loaded.files.len());
    if let Some(hook) = loaded.hook {
        if hook.ran {
            println!("  Ran:   {}", hook.command);
        } else {
            println!("  Skipped post-load command (use --run-hooks): {}", hook.command);
        }
    }
    Ok(())
}

fn cmd_load_all(
    mut config: Config,
    manifest_path: &Path,
    only: Vec<String>,
    clean: bool,
    jobs: Option<usize>,
    run_hooks: bool,
    latest: Option<LatestPolicy>,
) -> CmdResult {
    if let Some(latest) = latest {
        config.latest = latest;
    }
    if jobs.is_some() {
        config.jobs = jobs;
    }
    config.run_hooks |= run_hooks;

    let manifest = load_manifest(manifest_path)?;
    let project_root = match manifest_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };

    let loader = Loader::new(open_cache(&config)?, config.loader_options(&project_root))
        .with_hooks(config.hooks());
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("Interrupted; finishing packages already started");
        handler_token.cancel();
    })?;

    let batch = BatchLoader::new(loader)
        .with_jobs(config.jobs())
        .with_cancel_token(cancel);
    let filter = (!only.is_empty()).then_some(only.as_slice());
    let report = batch.load_all(&manifest.dependencies, filter, clean);

    print!("{}", format_batch_report(&report, &project_root));
    let failed = report.failures().count();
    if failed > 0 {
        return Err(format!("{} of {} packages failed", failed, report.len()).into());
    }
    Ok(())
}

fn cmd_publish(config: &Config, dir: &Path, options: &PublishOptions) -> CmdResult {
    let outcome = match publisher(config).publish(dir, options) {
        Ok(outcome) => outcome,
        Err(PublishError::Push { tag, source }) => {
            eprintln!("Local commit and tag are in place; only the push failed.");
            if let Some(tag) = &tag {
                eprintln!("Retry with: treeport push {} {}", tag, dir.display());
            }
            return Err(PublishError::Push { tag, source }.into());
        }
        Err(e) => return Err(e.into()),
    };

    print_outcome(&outcome, options, &config.remote);
    Ok(())
}

fn print_outcome(outcome: &PublishOutcome, options: &PublishOptions, remote: &str) {
    match &outcome.commit {
        Some(commit) => println!("Committed {}", short(commit)),
        None if options.commit => println!("No changes to commit"),
        None => {}
    }
    if let Some(tag) = &outcome.tag {
        println!("Tagged {} at {}", tag.name, short(&tag.commit));
    }
    if outcome.pushed {
        println!("Pushed to {}", remote);
    }
}

fn cmd_publish_db_repo(config: &Config, dir: &Path, options: &PublishOptions) -> CmdResult {
    let paths = CachePaths::new(config.cache_root()?);
    let publisher = publisher(config);
    let target = publisher.db_repo_target(dir, &paths)?;
    match publisher.publish_to_db_repo(dir, &paths, options) {
        Ok(outcome) => {
            print_outcome(&outcome, options, &target.remote.key.to_string());
            Ok(())
        }
        Err(PublishError::Push { tag, source }) => {
            eprintln!("Commit and tag are in place in {}; only the push failed.", target.checkout.display());
            if let Some(tag) = &tag {
                eprintln!("Retry with: treeport push --db-repo {} {}", tag, dir.display());
            }
            Err(PublishError::Push { tag, source }.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_publish_all(
    config: &Config,
    manifest_path: &Path,
    only: Vec<String>,
    options: &PublishOptions,
) -> CmdResult {
    let manifest = load_manifest(manifest_path)?;
    let project_root = match manifest_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let paths = CachePaths::new(config.cache_root()?);
    let filter = (!only.is_empty()).then_some(only.as_slice());
    let results = publisher(config).publish_manifest(&manifest, &project_root, filter, &paths, options);

    print!("{}", format_publish_report(&results));
    let failed = results.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        return Err(format!("{} of {} packages failed to publish", failed, results.len()).into());
    }
    Ok(())
}

fn cmd_push(config: &Config, dir: &Path, tag: &str, force: bool, db_repo: bool) -> CmdResult {
    let publisher = publisher(config);
    if db_repo {
        let paths = CachePaths::new(config.cache_root()?);
        let target = publisher.db_repo_target(dir, &paths)?;
        publisher.retry_push_in_db_repo(&target, tag, force)?;
        println!("Pushed {} and {} to {}", target.branch, tag, target.remote.key);
    } else {
        publisher.retry_push(dir, tag, force)?;
        println!("Pushed HEAD and {} to {}", tag, config.remote);
    }
    Ok(())
}

fn cmd_cache(config: &Config, command: CacheCommands) -> CmdResult {
    match command {
        CacheCommands::Path => {
            println!("{}", config.cache_root()?.display());
        }
        CacheCommands::List => {
            let cache = open_cache(config)?;
            print!("{}", format_cache_list(&cache.list()?));
        }
        CacheCommands::Remove { repo } => {
            let key: RepoKey = repo
                .parse()
                .map_err(|e| format!("Invalid repository '{}': {}", repo, e))?;
            let cache = open_cache(config)?;
            if cache.remove(&key)? {
                println!("Removed {}", key);
            } else {
                println!("{} is not cached", key);
            }
        }
        CacheCommands::Clear => {
            let cache = open_cache(config)?;
            let removed = cache.clear()?;
            println!("Removed {} repositories", removed);
        }
    }
    Ok(())
}

fn cmd_status(config: &Config) -> CmdResult {
    let cache = open_cache(config)?;
    let records = cache.state().loads()?;
    print!("{}", format_status(&records, cache.paths().root()));
    Ok(())
}

fn cmd_doctor(config: &Config) -> CmdResult {
    println!("treeport System Check\n");

    let git_ok = GitCli::new().is_available();
    println!(
        "[{}] git: {}",
        if git_ok { "OK" } else { "FAIL" },
        if git_ok { "available" } else { "not found" }
    );

    let config_path = default_config_path();
    let config_ok = config_path.as_ref().map(|p| p.is_file()).unwrap_or(false);
    println!(
        "[{}] Config: {}",
        if config_ok { "OK" } else { "INFO" },
        match &config_path {
            Some(p) if config_ok => p.display().to_string(),
            Some(p) => format!("{} (not present, using defaults)", p.display()),
            None => "unknown".to_string(),
        }
    );

    let cache_ok = match config.cache_root() {
        Ok(root) => {
            let usable = open_cache(config).is_ok();
            let size = treeport::cache::dir_size(&root);
            println!(
                "[{}] Cache dir: {} ({})",
                if usable { "OK" } else { "FAIL" },
                root.display(),
                format_size(size)
            );
            usable
        }
        Err(e) => {
            println!("[FAIL] Cache dir: {}", e);
            false
        }
    };

    println!(
        "[INFO] Latest policy: {}",
        match config.latest {
            LatestPolicy::HighestTag => "highest-tag",
            LatestPolicy::DefaultBranch => "default-branch",
        }
    );
    println!("[INFO] Initial version: {}", config.initial_version);

    if !git_ok || !cache_ok {
        std::process::exit(1);
    }

    Ok(())
}

fn short(commit: &str) -> &str {
    commit.get(..12).unwrap_or(commit)
}
