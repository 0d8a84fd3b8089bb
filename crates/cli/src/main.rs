mod logging;
mod resolve;
mod seed;
mod serve;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Idempotent assessment progression service.
#[derive(Parser)]
#[command(
    name = "intake",
    version,
    about = "Idempotent assessment progression service"
)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Port to listen on [env: INTAKE_PORT, default 8080]
        #[arg(long)]
        port: Option<u16>,
        /// Funnel seed file (JSON) [env: INTAKE_FUNNELS]
        #[arg(long)]
        funnels: Option<PathBuf>,
        /// Per-request timeout in milliseconds [env: INTAKE_REQUEST_TIMEOUT_MS, default 10000]
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// TLS certificate file (PEM), requires the `tls` feature
        #[arg(long)]
        tls_cert: Option<PathBuf>,
        /// TLS private key file (PEM), requires the `tls` feature
        #[arg(long)]
        tls_key: Option<PathBuf>,
    },

    /// Print the normalized definition of a funnel
    Resolve {
        /// Funnel slug
        slug: String,
        /// Funnel seed file (JSON)
        #[arg(long)]
        funnels: PathBuf,
        /// Output format (text or json)
        #[arg(long, default_value = "text", value_enum)]
        output: OutputFormat,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.log_json);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {}", e);
            process::exit(1);
        }
    };

    match cli.command {
        Commands::Serve {
            port,
            funnels,
            timeout_ms,
            tls_cert,
            tls_key,
        } => {
            // Validate TLS flags: both must be provided or neither
            if tls_cert.is_some() != tls_key.is_some() {
                eprintln!("error: --tls-cert and --tls-key must both be provided");
                process::exit(1);
            }
            let config = serve::ServeConfig::resolve(port, funnels, timeout_ms, tls_cert, tls_key);
            if let Err(e) = rt.block_on(serve::start_server(config)) {
                eprintln!("Server error: {}", e);
                process::exit(1);
            }
        }
        Commands::Resolve {
            slug,
            funnels,
            output,
        } => match rt.block_on(resolve::cmd_resolve(&funnels, &slug, output)) {
            Ok(text) => print!("{}", ensure_newline(text)),
            Err(e) => {
                eprintln!("error: {}", e);
                process::exit(1);
            }
        },
    }
}

fn ensure_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}
