//! # sicar-dl CLI
//!
//! Command-line interface for the sicar-dl library.
//! Downloads municipality shapefiles and CSVs from the rural environmental
//! registry, and replays the registry page's download trigger offline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::error;
use sicar_dl::{
    CaptchaSolver, CityDownload, CityOutcome, ClientConfig, Document, DownloadOptions, DownloadRequest,
    DownloadTrigger, FixedSolver, ManualSolver, OutputFormat, OverwriteBehavior, SicarClient,
    SourceConfig, State, TesseractSolver, DEFAULT_BASE_PATH, DEFAULT_BASE_URL, DEFAULT_EMAIL,
};

mod cli;

const PAGE_EMAIL: &str = "test@test.com";

/// Command-line interface for sicar-dl
#[derive(Parser, Debug)]
#[command(name = "sicar-dl")]
#[command(about = "Rural environmental registry (SICAR) municipality downloader")]
#[command(long_about = "Downloads municipality shapefiles or CSVs from the SICAR registry:
  sicar-dl cities AP               # List the municipalities of Amapá
  sicar-dl city 1600709            # Download one municipality
  sicar-dl state AP --format csv   # Download every municipality of a state
  sicar-dl trigger                 # Replay the page's hidden-frame trigger offline

File Overwrite Behavior:
  By default, you'll be prompted if destination file exists
  --force                          # Overwrite without asking
  --no-clobber                     # Never overwrite, fail if file exists")]
#[command(version = env!("SICAR_DL_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Contact email sent with every download request
    #[arg(long, global = true)]
    email: Option<String>,

    /// Output format: "shapefile" or "csv"
    #[arg(long, global = true, default_value = "shapefile")]
    format: OutputFormat,

    /// Destination folder
    #[arg(long, global = true, default_value = "temp")]
    folder: PathBuf,

    /// Captcha attempts per municipality
    #[arg(long, global = true, default_value_t = sicar_dl::DownloadOptions::default().tries)]
    tries: u32,

    /// How captchas are solved
    #[arg(long, global = true, value_enum, default_value_t = CaptchaKind::Tesseract)]
    captcha: CaptchaKind,

    /// Answer used by `--captcha fixed`
    #[arg(long, global = true)]
    captcha_value: Option<String>,

    /// Registry base URL
    #[arg(long, global = true, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Skip TLS certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Enable dry-run mode (show what would be downloaded without downloading)
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force overwrite existing files without prompting
    #[arg(short, long, global = true, conflicts_with = "no_clobber")]
    force: bool,

    /// Never overwrite existing files (fail if destination exists)
    #[arg(long, global = true)]
    no_clobber: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the page's download trigger against an in-memory document
    Trigger {
        /// Municipality id
        #[arg(long, default_value_t = sicar_dl::DownloadRequest::page_default().municipality_id)]
        municipio: u64,

        /// Captcha token placed in the query
        #[arg(long, default_value = "u6bsa")]
        captcha_token: String,

        /// Base path the format segment is appended to
        #[arg(long, default_value = DEFAULT_BASE_PATH)]
        base: String,

        /// Fire the frame's load event after cleanup and print its report
        #[arg(long)]
        simulate_load: bool,
    },
    /// List the municipalities of a state
    Cities {
        /// State code, e.g. "AP"
        state: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Download one municipality
    City {
        /// Municipality code
        code: u64,
    },
    /// Download every municipality of a state
    State {
        /// State code, e.g. "AP"
        state: String,
    },
    /// Download every municipality of every state
    Country,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum CaptchaKind {
    /// Show the image path and type the answer
    Manual,
    /// OCR through the tesseract executable
    Tesseract,
    /// Always answer with --captcha-value
    Fixed,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("❌ Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .init();

    if cli.verbose {
        eprintln!("🌳 sicar-dl v{} starting...", env!("SICAR_DL_VERSION"));
    }

    match &cli.command {
        Command::Trigger {
            municipio,
            captcha_token,
            base,
            simulate_load,
        } => run_trigger(&cli, *municipio, captcha_token, base, *simulate_load),
        Command::Cities { state, json } => list_cities(&cli, parse_state(state)?, *json).await,
        Command::City { code } => download_city(&cli, *code).await,
        Command::State { state } => download_state(&cli, parse_state(state)?).await,
        Command::Country => download_country(&cli).await,
    }
}

fn parse_state(input: &str) -> Result<State> {
    Ok(input.parse::<State>()?)
}

/// Determine overwrite behavior from CLI flags
fn overwrite_behavior(force: bool, no_clobber: bool) -> OverwriteBehavior {
    if force {
        OverwriteBehavior::Force
    } else if no_clobber {
        OverwriteBehavior::NeverOverwrite
    } else {
        OverwriteBehavior::Prompt
    }
}

fn build_solver(kind: CaptchaKind, value: Option<&str>) -> Result<Arc<dyn CaptchaSolver>> {
    Ok(match kind {
        CaptchaKind::Manual => Arc::new(ManualSolver::default()),
        CaptchaKind::Tesseract => Arc::new(TesseractSolver::default()),
        CaptchaKind::Fixed => {
            let token = value.context("--captcha fixed requires --captcha-value")?;
            Arc::new(FixedSolver::new(token))
        }
    })
}

fn client_config(cli: &Cli) -> ClientConfig {
    ClientConfig {
        source: SourceConfig::new(cli.base_url.as_str()),
        email: cli.email.clone().unwrap_or_else(|| DEFAULT_EMAIL.to_string()),
        accept_invalid_certs: cli.insecure,
        ..Default::default()
    }
}

async fn connect(cli: &Cli) -> Result<SicarClient> {
    let solver = build_solver(cli.captcha, cli.captcha_value.as_deref())?;
    let config = client_config(cli);
    let base_url = config.source.base_url.clone();
    SicarClient::connect(config, solver)
        .await
        .with_context(|| format!("could not open a session with {base_url}"))
}

fn download_options(cli: &Cli, progress: &cli::ProgressManager) -> DownloadOptions {
    DownloadOptions {
        overwrite: overwrite_behavior(cli.force, cli.no_clobber),
        tries: cli.tries.max(1),
        progress: Some(progress.callback()),
        ..Default::default()
    }
}

fn run_trigger(cli: &Cli, municipio: u64, captcha_token: &str, base: &str, simulate_load: bool) -> Result<()> {
    let email = cli.email.as_deref().unwrap_or(PAGE_EMAIL);
    let request = DownloadRequest::new(municipio, email, captcha_token, cli.format);
    let trigger = DownloadTrigger::new(request).with_base_path(base);

    if cli.dry_run {
        eprintln!("🔍 [DRY RUN] Would assign {} to the hidden frame", trigger.url());
        return Ok(());
    }

    let mut document = Document::new();
    let issued = trigger.issue(&mut document);
    let removed = trigger.cleanup(&mut document);

    println!("URL: {}", issued.url);
    println!("Frame created: {}", issued.frame_created);
    println!("Frames removed: {removed}");

    if simulate_load {
        // The frame is already detached here, exactly as on the page
        if let Some(report) = document.dispatch_load(issued.frame) {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

async fn list_cities(cli: &Cli, state: State, json: bool) -> Result<()> {
    if cli.dry_run {
        let url = SourceConfig::new(cli.base_url.as_str()).downloads_url(state);
        eprintln!("🔍 [DRY RUN] Would list municipalities of {state} ({}) from {url}", state.name());
        return Ok(());
    }

    let client = connect(cli).await?;
    let cities = client.get_cities_codes(state).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&cities)?);
    } else {
        for city in &cities {
            println!("{}\t{}", city.code, city.name);
        }
    }
    Ok(())
}

async fn download_city(cli: &Cli, code: u64) -> Result<()> {
    if cli.dry_run {
        let path = sicar_dl::resolve_output_path(&cli.folder, code, cli.format);
        eprintln!("🔍 [DRY RUN] Would download municipality {code} to {}", path.display());
        return Ok(());
    }

    let client = connect(cli).await?;
    let progress = cli::ProgressManager::new(0, &format!("🌐 Downloading municipality {code} ({})", cli.format));
    let options = download_options(cli, &progress);

    let saved = client.download_city_code(code, cli.format, &cli.folder, &options).await?;
    progress.finish();

    match saved {
        CityOutcome::Saved(path) => {
            eprintln!("📁 Saved to: {}", path.display());
            Ok(())
        }
        CityOutcome::Kept(path) => {
            eprintln!("⏭️  Kept existing file: {}", path.display());
            Ok(())
        }
        CityOutcome::Failed => bail!(
            "failed to download municipality {code} after {} attempt(s)",
            options.tries
        ),
    }
}

async fn download_state(cli: &Cli, state: State) -> Result<()> {
    if cli.dry_run {
        let folder = cli.folder.join(state.code());
        eprintln!(
            "🔍 [DRY RUN] Would download every municipality of {state} ({}) to {}",
            state.name(),
            folder.display()
        );
        return Ok(());
    }

    let client = connect(cli).await?;
    let progress = cli::ProgressManager::new(0, &format!("🌐 Downloading {state} ({})", state.name()));
    let options = download_options(cli, &progress);

    let results = client.download_state(state, cli.format, &cli.folder, &options).await?;
    progress.finish();

    report(&results, &cli.folder.join(state.code()));
    Ok(())
}

async fn download_country(cli: &Cli) -> Result<()> {
    if cli.dry_run {
        eprintln!(
            "🔍 [DRY RUN] Would download every municipality of {} states to {}",
            State::ALL.len(),
            cli.folder.display()
        );
        return Ok(());
    }

    let client = connect(cli).await?;
    let progress = cli::ProgressManager::new(0, "🌐 Downloading every state");
    let options = download_options(cli, &progress);

    let results = client.download_country(cli.format, &cli.folder, &options).await?;
    progress.finish();

    for state in &results {
        report(&state.cities, &cli.folder.join(state.state.code()));
    }
    Ok(())
}

fn report(results: &[CityDownload], folder: &Path) {
    let failed: Vec<&CityDownload> = results.iter().filter(|r| r.outcome.is_failed()).collect();
    let kept = results
        .iter()
        .filter(|r| matches!(r.outcome, CityOutcome::Kept(_)))
        .count();
    eprintln!(
        "✅ {}/{} municipalities saved to {}",
        results.len() - failed.len() - kept,
        results.len(),
        folder.display()
    );
    if kept > 0 {
        eprintln!("⏭️  {kept} existing file(s) kept");
    }
    for result in failed {
        eprintln!("❌ {} ({})", result.city.name, result.city.code);
    }
}
