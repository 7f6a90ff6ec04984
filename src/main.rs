//! TiRCorder launcher.
//!
//! Selects the role (`--server`, `--client`, `--both`), loads the JSON
//! configuration, layers CLI overrides on top, and runs the pipeline
//! service. An external legacy server script can be launched in place of
//! the built-in pipeline via `--server-script`.

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use std::io::Write;
use std::path::{Path, PathBuf};

use tircorder::config::{Config, FolderConfig};
use tircorder::service::Service;

#[derive(Parser)]
#[command(name = "tircorder")]
#[command(about = "Always-on audio ingestion pipeline: watch, transcribe, archive")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(group(ArgGroup::new("role").required(true).args(["server", "client", "both"])))]
struct Args {
    /// Run the watch/transcribe/convert server
    #[arg(long)]
    server: bool,

    /// Run the microphone capture client
    #[arg(long)]
    client: bool,

    /// Run server and client together
    #[arg(long)]
    both: bool,

    /// Legacy server script (or a directory of candidates) to launch
    /// instead of the built-in pipeline
    #[arg(long)]
    server_script: Option<PathBuf>,

    /// Directory the server watches, added to the configured folders
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Microphone index for the client
    #[arg(long)]
    device_id: Option<i64>,

    /// Where the client writes WAV + transcript logs
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Transcription WebUI base URL override (selects the webui backend)
    #[arg(long)]
    webui_url: Option<String>,

    /// Transcription WebUI endpoint path override
    #[arg(long)]
    webui_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting TiRCorder v{}", env!("CARGO_PKG_VERSION"));

    if args.client {
        // The capture client is a separate component that shares only the
        // on-disk handoff format with this server.
        bail!(
            "the capture client is not part of this binary (requested --client, \
             device {:?}); no input devices are available here",
            args.device_id
        );
    }
    if args.both {
        tracing::warn!("capture client is external; --both runs the server role only");
    }
    if args.output_dir.is_some() {
        tracing::warn!("--output-dir applies to the capture client; the server role ignores it");
    }

    if let Some(script) = &args.server_script {
        return run_server_script(script);
    }

    let mut config = Config::load().context("configuration error")?;
    config.apply_overrides(args.webui_url.as_deref(), args.webui_path.as_deref());
    if let Some(dir) = &args.data_dir {
        config.recordings_folders.push(FolderConfig {
            path: dir.display().to_string(),
            ..Default::default()
        });
    }

    let service = Service::new(config).await?;
    service.run().await
}

/// Launches a legacy Python server script in place of the built-in
/// pipeline, forwarding its exit status.
fn run_server_script(script: &Path) -> Result<()> {
    let script = resolve_server_script(script)?;
    tracing::info!("launching server script {}", script.display());

    let status = std::process::Command::new("python3")
        .arg(&script)
        .status()
        .with_context(|| format!("failed to launch {}", script.display()))?;
    if !status.success() {
        bail!("server script {} exited with {status}", script.display());
    }
    Ok(())
}

/// Resolves `--server-script`: a file is used as-is; a directory is
/// scanned for `j_servski-*.py`-style candidates, prompting interactively
/// when more than one matches.
fn resolve_server_script(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        bail!("server script {} does not exist", path.display());
    }

    let mut candidates = find_script_candidates(path)?;
    match candidates.len() {
        0 => bail!("no server script candidates under {}", path.display()),
        1 => Ok(candidates.remove(0)),
        _ => pick_candidate(candidates),
    }
}

fn find_script_candidates(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read {}", dir.display()))?
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("j_servski") && n.ends_with(".py"))
        })
        .collect();
    candidates.sort();
    Ok(candidates)
}

fn pick_candidate(candidates: Vec<PathBuf>) -> Result<PathBuf> {
    println!("Multiple server scripts found:");
    for (i, candidate) in candidates.iter().enumerate() {
        println!("  {i}. {}", candidate.display());
    }
    print!("Choose a script (0-{}): ", candidates.len() - 1);
    std::io::stdout().flush().ok();

    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("failed to read selection")?;
    let index: usize = line.trim().parse().context("not a valid selection")?;
    candidates
        .into_iter()
        .nth(index)
        .context("selection out of range")
}
