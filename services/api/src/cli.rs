use crate::commands::{run_process, run_stamp, ProcessArgs, StampArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use form_dispatch::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "form-dispatch",
    about = "Stamp, publish and mail scholarship application forms from webhook deliveries",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Run one webhook payload through the pipeline and print the batch report
    Process(ProcessArgs),
    /// Render a single stamped form locally without uploading or mailing it
    Stamp(StampArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Process(args) => run_process(args).await,
        Command::Stamp(args) => run_stamp(args).await,
    }
}
