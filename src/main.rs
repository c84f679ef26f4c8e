mod plugins;
mod update;

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{ProgressBar, ProgressStyle};
use plugins::archive::extractor::ZipExtractor;
use plugins::http::driver::HttpDriver;
use plugins::registry::{downloader_for, DriverContext, Transport};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use update::engine::{resolve_url, EngineConfig, UpdateEngine};
use update::error::EXIT_NOTHING_TO_DO;
use update::events::{EventKind, UpdateEvent};
use update::layout::LegacyLink;
use update::manifest::Manifest;
use update::model::UpdateOutcome;

fn build_cli() -> Command {
    let install_args = [
        Arg::new("source_url")
            .long("source-url")
            .help("Base URL the manifest and archives are served from")
            .required(true)
            .num_args(1),
        Arg::new("install_root")
            .long("install-root")
            .help("Directory that holds the content folder")
            .required(true)
            .num_args(1),
        Arg::new("folder")
            .long("folder")
            .help("Content folder name inside the install root")
            .required(true)
            .num_args(1),
        Arg::new("temp_dir")
            .long("temp-dir")
            .help("Staging area for downloads (defaults to the system temp dir)")
            .num_args(1),
        Arg::new("tool")
            .long("tool")
            .help("Path to the verify/patch executable")
            .default_value(if cfg!(windows) { "butler.exe" } else { "butler" })
            .num_args(1),
        Arg::new("tool_arg")
            .long("tool-arg")
            .help("Extra argument placed before the tool subcommand (repeatable)")
            .action(ArgAction::Append)
            .allow_hyphen_values(true)
            .num_args(1),
        Arg::new("manifest_name")
            .long("manifest-name")
            .help("Manifest document name under the source URL")
            .default_value("bullseye.json")
            .num_args(1),
        Arg::new("transport")
            .long("transport")
            .help("Archive transport: http or torrent")
            .default_value("http")
            .num_args(1),
        Arg::new("timeout_secs")
            .long("timeout-secs")
            .default_value("60")
            .num_args(1),
        Arg::new("retries")
            .long("retries")
            .default_value("2")
            .num_args(1),
        Arg::new("link")
            .long("link")
            .help("Legacy link SOURCE:LINK (SOURCE under the install root, LINK under the content folder)")
            .action(ArgAction::Append)
            .num_args(1),
    ];

    let sub = |name: &'static str, about: &'static str| Command::new(name).about(about).args(install_args.clone());

    Command::new("content-updater")
        .about("Install, patch and verify a versioned content tree")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(sub("install", "Download and extract the latest full archive"))
        .subcommand(sub("update", "Patch the installation to the latest version"))
        .subcommand(sub("verify", "Verify and heal the installed version"))
        .subcommand(sub("status", "Show installed and latest versions"))
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn arg<'a>(m: &'a ArgMatches, id: &str) -> anyhow::Result<&'a String> {
    m.get_one::<String>(id).with_context(|| format!("missing --{}", id.replace('_', "-")))
}

async fn open_engine(m: &ArgMatches) -> anyhow::Result<UpdateEngine> {
    let source_url = arg(m, "source_url")?.clone();
    let driver_ctx = DriverContext {
        timeout_secs: arg(m, "timeout_secs")?.parse().context("--timeout-secs")?,
        retries: arg(m, "retries")?.parse().context("--retries")?,
        ..DriverContext::default()
    };

    let manifest_url = resolve_url(&source_url, arg(m, "manifest_name")?);
    let text = HttpDriver::new(driver_ctx.clone())?
        .fetch_text(&manifest_url)
        .await
        .with_context(|| format!("fetch manifest {}", manifest_url))?;
    let manifest = Manifest::from_json(&text).with_context(|| format!("parse manifest {}", manifest_url))?;

    let links = m
        .get_many::<String>("link")
        .into_iter()
        .flatten()
        .map(|s| s.parse::<LegacyLink>())
        .collect::<anyhow::Result<Vec<_>>>()?;

    let cfg = EngineConfig {
        source_url,
        install_root: PathBuf::from(arg(m, "install_root")?),
        content_folder: arg(m, "folder")?.clone(),
        temp_dir: m
            .get_one::<String>("temp_dir")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir),
        tool_path: PathBuf::from(arg(m, "tool")?),
        tool_args: m.get_many::<String>("tool_arg").into_iter().flatten().cloned().collect(),
        links,
    };

    let transport: Transport = arg(m, "transport")?.parse()?;
    let downloader = downloader_for(transport, driver_ctx)?;
    Ok(UpdateEngine::open(cfg, manifest, downloader, Arc::new(ZipExtractor::new())).await)
}

fn attach_progress(engine: &UpdateEngine) -> ProgressBar {
    let pb = ProgressBar::new(1000);
    if let Ok(style) = ProgressStyle::with_template("{bar:40.cyan/blue} {percent:>3}% {wide_msg}") {
        pb.set_style(style);
    }

    let bar = pb.clone();
    engine.events().subscribe(EventKind::Progress, move |ev| {
        if let UpdateEvent::Progress(p) = ev {
            bar.set_position((p.fraction * 1000.0) as u64);
            bar.set_message(format!("{}/s", fmt_bytes(p.bytes_per_second as u64)));
        }
    });
    let bar = pb.clone();
    engine.events().subscribe(EventKind::Error, move |ev| {
        if let UpdateEvent::Error(e) = ev {
            bar.println(format!("[ERR] {}", e.message));
        }
    });
    engine.events().log_to_tracing();
    pb
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let matches = build_cli().get_matches();
    let (name, m) = matches.subcommand().context("no subcommand")?;

    let mut engine = open_engine(m).await?;

    if name == "status" {
        let state = engine.state();
        println!("installed: {}", state.installed_version.as_deref().unwrap_or("-"));
        println!("latest:    {}", engine.manifest().latest_version().map(|v| v.id.as_str()).unwrap_or("-"));
        println!("verify pending: {}", state.needs_forced_verify);
        return Ok(ExitCode::SUCCESS);
    }

    let pb = attach_progress(&engine);
    let result = match name {
        "install" => engine.install().await.map(|_| 0),
        "update" => engine.update().await.map(|outcome| match outcome {
            UpdateOutcome::Updated => 0,
            UpdateOutcome::UpToDate | UpdateOutcome::VerifyPending => EXIT_NOTHING_TO_DO,
        }),
        "verify" => engine.verify().await.map(|_| 0),
        other => anyhow::bail!("unknown subcommand {}", other),
    };
    pb.finish_and_clear();

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "{} failed", name);
            e.exit_code()
        }
    };
    Ok(ExitCode::from(code))
}

fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.2}GiB", f / GB)
    } else if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
