mod display;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use display::{ArchiveProgress, ScanProgress};
use output::{
    BackupOutput, InitOutput, LsEntry, LsOutput, OutputWriter, RestoreOutput, SnapshotInfo,
    SnapshotsOutput,
};
use std::cell::Cell;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};
use strata_core::{
    Algorithm, Archiver, Error, LocalStore, MetadataDetector, Node, Progress, ProgressSink,
    Restorer, Scanner, Snapshot, Tree, find_snapshot, latest_snapshot_of, list_snapshots,
    min_prefix_len,
};
use tracing_subscriber::EnvFilter;

/// Strata - a deduplicating backup tool
#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Deduplicating, content-addressed backups using BLAKE3", long_about = None)]
#[command(version)]
struct Cli {
    /// Repository directory
    #[arg(short, long, global = true, env = "STRATA_REPO", default_value = "./strata-repo")]
    repo: PathBuf,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging (otherwise RUST_LOG applies)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new repository
    Init {
        /// Hash algorithm to use
        #[arg(long, default_value = "blake3")]
        algo: String,
    },

    /// Back up a file or directory
    Backup {
        /// Path to back up
        path: PathBuf,

        /// Snapshot to diff against (defaults to the latest snapshot of the same path)
        #[arg(long)]
        parent: Option<String>,

        /// Read every file, ignoring any parent snapshot
        #[arg(long, conflicts_with = "parent")]
        force: bool,

        /// Report unreadable items and keep going instead of aborting
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Restore a snapshot into a directory
    Restore {
        /// Snapshot id or unique prefix
        snapshot: String,

        /// Destination directory
        target: PathBuf,

        /// Only restore this path, relative to the backed-up directory
        #[arg(long)]
        include: Option<PathBuf>,

        /// Report failed items and keep going instead of aborting
        #[arg(long)]
        continue_on_error: bool,
    },

    /// List snapshots
    Snapshots,

    /// List the contents of a snapshot
    Ls {
        /// Snapshot id or unique prefix
        snapshot: String,

        /// Show type, mode and size
        #[arg(short, long)]
        long: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let out = OutputWriter::new(cli.json);
    let repo = cli.repo.as_path();

    let result = match cli.command {
        Commands::Init { algo } => cmd_init(&out, repo, &algo),
        Commands::Backup {
            path,
            parent,
            force,
            continue_on_error,
        } => cmd_backup(&out, repo, &path, parent.as_deref(), force, continue_on_error),
        Commands::Restore {
            snapshot,
            target,
            include,
            continue_on_error,
        } => cmd_restore(
            &out,
            repo,
            &snapshot,
            &target,
            include.as_deref(),
            continue_on_error,
        ),
        Commands::Snapshots => cmd_snapshots(&out, repo),
        Commands::Ls { snapshot, long } => cmd_ls(&out, repo, &snapshot, long),
    };

    if let Err(e) = result {
        out.write_error(&e);
        std::process::exit(1);
    }
}

fn open_repo(repo: &Path) -> Result<LocalStore> {
    LocalStore::open(repo).with_context(|| format!("Failed to open repository at {}", repo.display()))
}

/// Live progress only makes sense on a terminal and outside JSON mode.
fn progress(out: &OutputWriter, sink: impl ProgressSink + 'static) -> Progress {
    if !out.is_json() && std::io::stderr().is_terminal() {
        Progress::new(Duration::from_secs(1), sink)
    } else {
        Progress::disabled()
    }
}

/// Print each failed item and count it.
fn reporting_handler(
    errors: &Rc<Cell<usize>>,
) -> impl Fn(&Path, Option<&Node>, Error) -> strata_core::Result<()> + 'static {
    let errors = Rc::clone(errors);
    move |path: &Path, _: Option<&Node>, err: Error| -> strata_core::Result<()> {
        errors.set(errors.get() + 1);
        display::print_error(path, &err);
        Ok(())
    }
}

fn cmd_init(out: &OutputWriter, repo: &Path, algo: &str) -> Result<()> {
    let algorithm = Algorithm::parse(algo)?;

    LocalStore::init(repo, algorithm)
        .with_context(|| format!("Failed to initialize repository at {}", repo.display()))?;

    let data = InitOutput {
        success: true,
        repo: repo.display().to_string(),
        algorithm: algorithm.as_str().to_string(),
    };
    out.write(&data, || {
        format!(
            "Initialized strata repository at {}\nAlgorithm: {}\n",
            repo.display(),
            algorithm.as_str()
        )
    })
}

fn cmd_backup(
    out: &OutputWriter,
    repo: &Path,
    path: &Path,
    parent: Option<&str>,
    force: bool,
    continue_on_error: bool,
) -> Result<()> {
    let store = open_repo(repo)?;
    let start = Instant::now();
    let source = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))?;

    let parent = match (parent, force) {
        (_, true) => None,
        (Some(prefix), false) => Some(
            find_snapshot(&store, prefix)
                .with_context(|| format!("Failed to find parent snapshot {}", prefix))?,
        ),
        (None, false) => latest_snapshot_of(&store, &source)?,
    };

    let errors = Rc::new(Cell::new(0));
    let mut scanner = Scanner::new(progress(out, ScanProgress));
    if continue_on_error {
        scanner = scanner.with_error_handler(reporting_handler(&errors));
    }
    let mut tree = scanner
        .scan(&source)
        .with_context(|| format!("Failed to scan {}", source.display()))?;

    let mut reused = 0;
    if let Some(parent_id) = parent {
        let snapshot = Snapshot::load(&store, &parent_id)
            .with_context(|| format!("Failed to load parent snapshot {}", parent_id.short()))?;
        let parent_tree = Tree::load(&store, &snapshot.tree)?;
        reused = tree.copy_from(&parent_tree, &store, &MetadataDetector)?;
        tracing::info!(parent = %parent_id.short(), reused, "diffing against parent snapshot");
    }

    let todo = tree.stat_todo();
    let mut archiver = Archiver::new(&store, progress(out, ArchiveProgress::new(todo)));
    if continue_on_error {
        archiver = archiver.with_error_handler(reporting_handler(&errors));
    }
    let (tree, snapshot_id) = archiver
        .snapshot(&source, tree, parent)
        .with_context(|| format!("Failed to back up {}", source.display()))?;

    let snapshot = Snapshot::load(&store, &snapshot_id)?;
    let data = BackupOutput {
        success: true,
        snapshot: snapshot_id,
        tree: snapshot.tree,
        parent,
        source: source.display().to_string(),
        stat: tree.stat(),
        reused,
        errors: errors.get(),
        duration_secs: start.elapsed().as_secs_f64(),
    };
    out.write(&data, || {
        let mut text = String::new();
        if let Some(parent) = parent {
            text.push_str(&format!("using parent snapshot {}\n", parent.short()));
        }
        text.push_str(&format!(
            "snapshot {} saved: {} files, {} dirs, {} ({} reused) in {}\n",
            snapshot_id.short(),
            data.stat.files,
            data.stat.dirs,
            display::format_bytes(data.stat.bytes),
            reused,
            display::format_duration(start.elapsed())
        ));
        if data.errors > 0 {
            text.push_str(&format!("{} items skipped because of errors\n", data.errors));
        }
        text
    })
}

fn cmd_restore(
    out: &OutputWriter,
    repo: &Path,
    prefix: &str,
    target: &Path,
    include: Option<&Path>,
    continue_on_error: bool,
) -> Result<()> {
    let store = open_repo(repo)?;
    let id = find_snapshot(&store, prefix)
        .with_context(|| format!("Failed to find snapshot {}", prefix))?;

    let errors = Rc::new(Cell::new(0));
    let mut restorer = Restorer::new(&store, &id)
        .with_context(|| format!("Failed to load snapshot {}", id.short()))?;
    if continue_on_error {
        restorer = restorer.with_error_handler(reporting_handler(&errors));
    }
    if let Some(include) = include {
        // Keep the selected path, everything below it, and the dirs leading to it.
        let selected = restorer.snapshot().dir.join(include);
        restorer = restorer.with_filter(move |source: &Path, _: &Path, _: &Node| {
            source.starts_with(&selected) || selected.starts_with(source)
        });
    }

    restorer
        .restore_to(target)
        .with_context(|| format!("Failed to restore {} to {}", id.short(), target.display()))?;

    let data = RestoreOutput {
        success: true,
        snapshot: id,
        destination: target.display().to_string(),
        errors: errors.get(),
    };
    out.write(&data, || {
        let mut text = format!("restored snapshot {} to {}\n", id.short(), target.display());
        if data.errors > 0 {
            text.push_str(&format!("{} items failed\n", data.errors));
        }
        text
    })
}

fn cmd_snapshots(out: &OutputWriter, repo: &Path) -> Result<()> {
    let store = open_repo(repo)?;
    let snapshots = list_snapshots(&store).context("Failed to list snapshots")?;

    let ids: Vec<_> = snapshots.iter().map(|(id, _)| *id).collect();
    let width = min_prefix_len(&ids);

    let data = SnapshotsOutput {
        success: true,
        snapshots: snapshots
            .into_iter()
            .map(|(id, sn)| SnapshotInfo {
                id,
                short_id: id.to_hex()[..width].to_string(),
                time: sn.time,
                dir: sn.dir.display().to_string(),
                hostname: sn.hostname,
                username: sn.username,
                stat: sn.stat,
            })
            .collect(),
    };
    out.write(&data, || {
        if data.snapshots.is_empty() {
            return "No snapshots (use 'strata backup' to create one)\n".to_string();
        }
        let mut text = String::new();
        for sn in &data.snapshots {
            text.push_str(&format!(
                "{:width$}  {}  {:>10}  {}\n",
                sn.short_id,
                sn.time.format("%Y-%m-%d %H:%M:%S"),
                display::format_bytes(sn.stat.bytes),
                sn.dir,
                width = width
            ));
        }
        text
    })
}

fn cmd_ls(out: &OutputWriter, repo: &Path, prefix: &str, long: bool) -> Result<()> {
    let store = open_repo(repo)?;
    let id = find_snapshot(&store, prefix)
        .with_context(|| format!("Failed to find snapshot {}", prefix))?;
    let snapshot = Snapshot::load(&store, &id)?;
    let tree = Tree::load_recursive(&store, &snapshot.tree)
        .with_context(|| format!("Failed to load trees of snapshot {}", id.short()))?;

    let mut entries = Vec::new();
    let mut stack = vec![(PathBuf::new(), &tree)];
    while let Some((dir, tree)) = stack.pop() {
        for node in &tree.nodes {
            let path = dir.join(&node.name);
            if let Some(children) = &node.children {
                stack.push((path.clone(), children));
            }
            entries.push(LsEntry {
                path: path.display().to_string(),
                node_type: node.node_type.as_str().to_string(),
                mode: node.mode,
                size: node.size,
                mtime: node.mtime,
                link_target: node.link_target.clone(),
            });
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let data = LsOutput {
        success: true,
        snapshot: id,
        entries,
    };
    out.write(&data, || {
        let mut text = String::new();
        for entry in &data.entries {
            if long {
                text.push_str(&format!(
                    "{:<7} {:04o} {:>10}  {}",
                    entry.node_type, entry.mode, entry.size, entry.path
                ));
                if let Some(target) = &entry.link_target {
                    text.push_str(&format!(" -> {}", target));
                }
                text.push('\n');
            } else {
                text.push_str(&entry.path);
                text.push('\n');
            }
        }
        text
    })
}
