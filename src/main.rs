use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::info;
use posterpress::config::ExportPlan;
use posterpress::pipeline::Exporter;
use posterpress::{Backend, LaunchConfig};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendChoice {
    /// Every compiled backend, `cdp` first
    Auto,
    Cdp,
    Oxide,
}

/// Export a static HTML poster to high-resolution PNG and PDF files.
#[derive(Debug, Parser)]
#[command(name = "posterpress", version, about)]
struct Cli {
    /// TOML export plan; without it the built-in two-variant poster plan is used
    #[arg(long)]
    plan: Option<PathBuf>,

    /// HTML document to render (overrides the plan's `input`)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output directory (overrides the plan's `output_dir`)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Primary backend
    #[arg(long, value_enum, default_value_t = BackendChoice::Auto)]
    backend: BackendChoice,

    /// Do not retry failed variants on another backend
    #[arg(long)]
    no_fallback: bool,

    /// Browser executable to launch instead of the autodetected one
    #[arg(long)]
    chrome: Option<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

fn load_plan(cli: &Cli) -> Result<ExportPlan> {
    let mut plan = match &cli.plan {
        Some(path) => ExportPlan::from_toml_file(path)
            .with_context(|| format!("loading plan {}", path.display()))?,
        None => ExportPlan::poster_defaults("index.html", "exports"),
    };
    if let Some(input) = &cli.input {
        plan.input = input.clone();
    }
    if let Some(dir) = &cli.out_dir {
        plan.output_dir = dir.clone();
    }
    plan.validate().context("invalid export plan")?;
    Ok(plan)
}

#[allow(unused_mut)]
fn backends(choice: BackendChoice, fallback: bool) -> Result<Vec<Box<dyn Backend>>> {
    let mut all: Vec<Box<dyn Backend>> = Vec::new();
    #[cfg(feature = "cdp")]
    all.push(Box::new(posterpress::CdpBackend::new()));
    #[cfg(feature = "oxide")]
    all.push(Box::new(posterpress::OxideBackend::new()));

    let wanted = match choice {
        BackendChoice::Auto => None,
        BackendChoice::Cdp => Some("cdp"),
        BackendChoice::Oxide => Some("oxide"),
    };
    let primary = match wanted {
        None if all.is_empty() => bail!("no backend compiled into this build"),
        None => 0,
        Some(name) => match all.iter().position(|b| b.name() == name) {
            Some(i) => i,
            None => bail!("backend '{}' is not compiled into this build", name),
        },
    };

    let first = all.remove(primary);
    let mut ordered = vec![first];
    if fallback {
        ordered.extend(all);
    }
    Ok(ordered)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let plan = load_plan(&cli)?;

    let launch = LaunchConfig {
        executable: cli.chrome.clone(),
        ..Default::default()
    };
    let exporter = Exporter::new(backends(cli.backend, !cli.no_fallback)?).launch_config(launch);
    info!(
        "exporting {} variant(s) of {} with backends {:?}",
        plan.variants.len(),
        plan.input.display(),
        exporter.backend_names()
    );

    let report = exporter.run(&plan).await;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in report.summary_lines() {
            println!("{}", line);
        }
    }

    std::process::exit(report.exit_code());
}
