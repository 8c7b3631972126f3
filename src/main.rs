//! mediafirefs — mount a MediaFire account as a local filesystem.
//!
//! The binary wires the pieces together: parse the command line, merge it
//! over the configuration file, obtain a session, load the stored tree
//! snapshot (or rebuild from scratch on first use) and hand the assembled
//! state to FUSE.

mod api_client;
mod cache;
mod config;
mod error;
mod fs;
mod openfile;
mod patch;
mod reconciler;
#[cfg(test)]
mod testutil;
mod tree;

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use fuser::MountOption;
use tracing::{info, warn};

use crate::api_client::ApiClient;
use crate::cache::FileCache;
use crate::config::Config;
use crate::error::MfResult;
use crate::fs::{FsWrapper, MediaFs};
use crate::tree::FolderTree;

#[derive(Parser, Debug)]
#[command(name = "mediafirefs", version, about = "Mount a MediaFire account as a local filesystem")]
struct Args {
    /// Where to mount the filesystem.
    mountpoint: PathBuf,

    #[arg(short = 'u', long)]
    username: Option<String>,

    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Configuration file; defaults to $XDG_CONFIG_HOME/mediafirefs/config.toml.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// API server domain.
    #[arg(long)]
    server: Option<String>,

    #[arg(short = 'i', long = "app-id")]
    app_id: Option<u32>,

    #[arg(short = 'k', long = "api-key")]
    api_key: Option<String>,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short = 'f', long)]
    foreground: bool,
}

fn other_err(msg: impl Into<String>) -> crate::error::MfError {
    std::io::Error::other(msg.into()).into()
}

/// `$XDG_<env>_HOME/mediafirefs`, falling back to `$HOME/<fallback>/mediafirefs`.
fn home_subdir(env_var: &str, fallback: &str) -> MfResult<PathBuf> {
    if let Ok(dir) = std::env::var(env_var) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir).join("mediafirefs"));
        }
    }
    let home = std::env::var("HOME").map_err(|_| other_err("HOME is not set"))?;
    Ok(PathBuf::from(home).join(fallback).join("mediafirefs"))
}

/// Per-account cache subdirectory name.
fn account_dir_name(username: &str) -> String {
    username
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

fn run(args: Args) -> MfResult<()> {
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => home_subdir("XDG_CONFIG_HOME", ".config")?.join("config.toml"),
    };
    let mut config = Config::load(&config_path);

    // the command line wins over the configuration file
    if let Some(username) = args.username {
        config.username = Some(username);
    }
    if let Some(password) = args.password {
        config.password = Some(password);
    }
    if let Some(server) = args.server {
        config.server = server;
    }
    if let Some(app_id) = args.app_id {
        config.app_id = app_id;
    }
    if let Some(api_key) = args.api_key {
        config.api_key = Some(api_key);
    }

    let username = config.username.clone().ok_or_else(|| other_err("username not configured"))?;
    let password = config.password.clone().ok_or_else(|| other_err("password not configured"))?;

    let cache_root = match &config.cache_dir {
        Some(dir) => dir.clone(),
        None => home_subdir("XDG_CACHE_HOME", ".cache")?,
    };
    let account_dir = cache_root.join(account_dir_name(&username));
    let dircache = account_dir.join("directorytree");
    let filecache = account_dir.join("files");

    // fork before any thread exists; the Tokio runtime comes after
    if !args.foreground {
        daemonize::Daemonize::new()
            .working_directory("/")
            .start()
            .map_err(|e| other_err(format!("cannot daemonize: {e}")))?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    info!(server = %config.server, username = %username, "logging in");
    let remote = runtime.block_on(ApiClient::login(
        &config.server,
        &username,
        &password,
        config.app_id,
        config.api_key.as_deref(),
    ))?;

    let cache = FileCache::open(&filecache)?;

    let mut tree = match File::open(&dircache) {
        Ok(mut file) => match FolderTree::load(&mut file) {
            Ok(tree) => {
                info!(path = %dircache.display(), revision = tree.revision(), "loaded tree snapshot");
                Some(tree)
            }
            Err(e) => {
                warn!(path = %dircache.display(), error = %e, "snapshot unusable, rebuilding");
                None
            }
        },
        Err(_) => None,
    }
    .unwrap_or_else(FolderTree::new);

    if tree.revision() == 0 {
        runtime.block_on(reconciler::full_rebuild(&mut tree, &cache, &remote))?;
    } else if let Err(e) = runtime.block_on(reconciler::refresh(&mut tree, &remote, false)) {
        // a failed catch-up is not fatal; the next getattr retries
        warn!(error = %e, "initial refresh failed");
    }
    info!(revision = tree.revision(), entries = tree.entry_count(), "tree ready");

    let fs = MediaFs::new(config, runtime, remote, tree, cache, dircache);
    let options =
        vec![MountOption::AutoUnmount, MountOption::FSName("mediafirefs".to_string())];
    info!(mountpoint = %args.mountpoint.display(), "mounting");
    fuser::mount2(FsWrapper(Arc::new(Mutex::new(fs))), &args.mountpoint, &options)?;
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediafirefs=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            eprintln!("mediafirefs: {e}");
            ExitCode::FAILURE
        }
    }
}
