mod annotations;
mod callgraph;
mod cfg;
mod config;
mod dataflow;
mod descriptor;
mod ir;
mod nullness;
mod report;
mod session;
mod summary;
mod telemetry;
#[cfg(test)]
mod test_harness;
mod vna;

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::{AnalysisArgs, AnalysisConfig};
use crate::ir::Program;
use crate::session::AnalysisSession;
use crate::telemetry::{Telemetry, init_logging};

/// CLI arguments for nullflow execution.
#[derive(Parser, Debug)]
#[command(
    name = "nullflow",
    about = "Branch-sensitive nullness dataflow over JVM method control flow graphs.",
    version
)]
struct Cli {
    /// Program description in JSON.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
    /// OTLP HTTP endpoint receiving analysis spans.
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
    #[command(flatten)]
    analysis: AnalysisArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet);
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }
    let telemetry = cli.otel.as_deref().map(Telemetry::connect).transpose()?;

    let started_at = Instant::now();
    let program = read_program(&cli.input)?;
    let load_duration_ms = started_at.elapsed().as_millis();
    let config = AnalysisConfig::from(&cli.analysis);
    let session = AnalysisSession::new(&program, config, telemetry.as_ref());
    let analysis_started_at = Instant::now();
    let report = session.run();
    let analysis_duration_ms = analysis_started_at.elapsed().as_millis();
    if let Some(telemetry) = &telemetry {
        telemetry.shutdown()?;
    }
    let report = report?;

    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &report)
        .context("failed to serialize analysis report")?;
    writer
        .write_all(b"\n")
        .context("failed to write analysis report")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} load_ms={} analysis_ms={} classes={} methods={}",
            started_at.elapsed().as_millis(),
            load_duration_ms,
            analysis_duration_ms,
            program.classes.len(),
            report.methods.len()
        );
    }

    Ok(())
}

fn read_program(path: &Path) -> Result<Program> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(file));
    serde_path_to_error::deserialize(&mut deserializer)
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}
