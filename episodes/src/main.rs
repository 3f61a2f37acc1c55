use std::io::{self, IsTerminal};
use std::num::NonZeroU8;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;
use url::Url;

use episodes::discovery::ARCHIVE_URL;
use episodes::render::{Console, PlainRenderer};
use episodes::run::{DEFAULT_OUTPUT, DEFAULT_WORKERS};
use episodes::{Archive, Options};

/// Download every episode of the podcast archive.
#[derive(Debug, Parser)]
#[command(name = "episodes", version)]
struct Cli {
    /// Destination where episodes should be saved.
    #[arg(short, long, default_value = DEFAULT_OUTPUT, value_name = "DIR")]
    output: PathBuf,

    /// Number of concurrent downloads.
    #[arg(short, long, default_value_t = DEFAULT_WORKERS, value_name = "N")]
    workers: NonZeroU8,

    /// First page of the archive.
    #[arg(long, default_value = ARCHIVE_URL)]
    url: Url,

    /// Print plain lines instead of repainting progress in place.
    #[arg(long)]
    plain: bool,
}

/// Log to stderr, warnings and errors only unless `RUST_LOG` says otherwise.
///
/// With a live progress block, log lines go through `console` so that they are printed above the block.
fn init_logging(console: Option<&Console<io::Stdout>>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let writer = match console {
        Some(console) => BoxMakeWriter::new(console.log_writer()),
        None => BoxMakeWriter::new(io::stderr),
    };

    tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(writer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let options = Options::default().with_output(cli.output).with_workers(cli.workers);
    let archive = Archive::new(cli.url);

    let report = if !cli.plain && io::stdout().is_terminal() {
        let console = Console::new(io::stdout());
        init_logging(Some(&console));
        episodes::run(options, &archive, console).await
    } else {
        init_logging(None);
        episodes::run(options, &archive, PlainRenderer::new(io::stdout())).await
    }
    .context("download aborted")?;

    println!(
        "Downloaded {}, skipped {}, failed {}",
        report.downloaded.len(),
        report.skipped,
        report.failed.len()
    );

    for (key, err) in &report.failed {
        println!("Failed {key}: {err}");
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
