use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mailverify_lib::{HostsSettings, Pipeline, PipelineOptions, Verifier, VerifyStatus};

mod args;
mod records;

use args::{Cli, Commands, VerifyArgs};
use records::{Format, ReportSink};

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.default_filter())),
        )
        .init();

    match cli.cmd {
        Commands::Statuses => {
            for status in VerifyStatus::all() {
                println!("{:<22} {}", status.code(), status.description());
            }
            Ok(())
        }
        Commands::Verify(args) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("tokio runtime")?;
            runtime.block_on(verify(args))
        }
    }
}

async fn verify(args: VerifyArgs) -> Result<()> {
    let format: Format = args.format.parse()?;
    let settings = load_settings(&args)?;

    let mut builder = Verifier::builder()
        .with_settings(settings)
        .with_connect_timeout(args.connect_timeout()?);
    if let Some(proxy) = &args.proxy {
        info!(proxy = %proxy, "using SOCKS5 proxy");
        builder = builder.with_socks_proxy(proxy.clone());
    }
    let verifier = builder.build().context("DNS resolver setup")?;

    let options = PipelineOptions {
        max_concurrent: args.max_concurrent,
        min_interval: args.min_interval(),
        ..PipelineOptions::default()
    };
    let input = records::open_input(args.input.as_deref()).await?;
    let mut sink = ReportSink::create(format, args.out.as_deref()).await?;

    let report = Pipeline::new(verifier, options)
        .run(records::read_records(input), &mut sink)
        .await
        .context("verification stopped")?;

    for status in VerifyStatus::all() {
        let count = report.count(*status);
        if count > 0 {
            eprintln!("{:<22} {count}", status.code());
        }
    }
    eprintln!(
        "{} addresses in {:.1}s",
        report.processed,
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

#[cfg(feature = "with-yaml")]
fn load_settings(args: &VerifyArgs) -> Result<HostsSettings> {
    match &args.hosts_config {
        Some(path) => HostsSettings::from_yaml_file(path)
            .with_context(|| format!("hosts config {}", path.display())),
        None => Ok(HostsSettings::default()),
    }
}

#[cfg(not(feature = "with-yaml"))]
fn load_settings(_args: &VerifyArgs) -> Result<HostsSettings> {
    Ok(HostsSettings::default())
}
