use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use slackvault::{run_export, ExportRequest, SessionOptions, WorkspaceContext};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Archive Slack conversations into incrementally-updated markdown files.
#[derive(Parser, Debug)]
#[command(name = "slackvault", version, about)]
struct Cli {
    /// Channel names, @handles, or IDs to export (comma-separated lists accepted)
    #[arg(required = true, value_delimiter = ',')]
    targets: Vec<String>,

    /// Workspace URL, e.g. https://acme.slack.com
    #[arg(long)]
    workspace: String,

    /// Workspace team ID, e.g. T0123ABCD
    #[arg(long)]
    team: String,

    /// State directory (credentials, cursors, exports)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Ignore stored cursors and rebuild the export files from the start
    #[arg(long)]
    full: bool,

    /// Open a visible browser window and wait for a manual sign-in
    #[arg(long)]
    login: bool,

    /// Seconds to wait for a manual sign-in
    #[arg(long, default_value_t = 300)]
    login_timeout: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("slackvault=info")),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli
        .data_dir
        .unwrap_or_else(WorkspaceContext::default_data_dir);
    let ctx = WorkspaceContext::new(cli.workspace.trim_end_matches('/'), &cli.team, data_dir);

    let session_opts = SessionOptions {
        headless: !cli.login,
        interactive: cli.login,
        login_timeout: Duration::from_secs(cli.login_timeout),
    };
    let request = ExportRequest {
        targets: cli.targets,
        full: cli.full,
    };

    match run_export(&ctx, &session_opts, &request).await {
        Ok(report) => {
            for exported in &report.exported {
                println!(
                    "{}: {} new messages -> {}",
                    exported.display_name,
                    exported.new_messages,
                    exported.path.display()
                );
            }
            for target in &report.up_to_date {
                println!("{}: up to date", target);
            }
            for failure in &report.failures {
                eprintln!("{}: {}", failure.target, failure.error);
            }
            if !report.failures.is_empty() {
                std::process::exit(1);
            }
        }
        Err(e) => {
            tracing::error!("Export run failed: {}", e);
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}
