use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind as ClapErrorKind;
use clap::Parser;

use pull_box::config::{config_path, Config, CONFIG_ENV};
use pull_box::host::DEFAULT_OUTPUT;
use pull_box::pipeline::{PullReport, Puller};
use pull_box::progress::ConsoleProgress;

/// Pull a container image and save it as a docker-loadable tarball.
#[derive(Parser, Debug)]
#[command(name = "pullbox", version, about)]
struct Cli {
    /// Image reference, e.g. `alpine`, `ghcr.io/org/app:v1`, `repo@sha256:...`
    image: String,

    /// Where to write the tarball
    #[arg(default_value = DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Registry credentials file (defaults to ./config.json)
    #[arg(long, env = CONFIG_ENV)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                print!("{}", e.render());
                return ExitCode::SUCCESS;
            }
            _ => {
                print!("{}", e.render());
                return ExitCode::FAILURE;
            }
        },
    };

    let progress = ConsoleProgress::new();
    match run(&cli, &progress).await {
        Ok(report) => {
            progress.finish();
            println!("image saved to {}", report.output.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            progress.abandon();
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, progress: &ConsoleProgress) -> Result<PullReport, Box<dyn std::error::Error>> {
    let config = Config::load(&config_path(cli.config.clone()))?;
    println!("pulling image {}...", cli.image);

    let report = Puller::native()?
        .pull_to_file(
            &cli.image,
            &cli.output,
            &config.authenticator(),
            Arc::new(progress.clone()),
        )
        .await?;
    Ok(report)
}
