use certpin_bin::{LogFormat, capture, init_logging, run};
use certpin_core::capture::CertificateFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy
    Run {
        #[arg(short, long, default_value = "/etc/certpin/config.yaml")]
        config: PathBuf,
    },
    /// Save the certificate a server presents, for use as `pinned_cert`
    Capture {
        /// Server to connect to, as host:port
        address: String,
        /// File to write the certificate to
        output: PathBuf,
        /// Name to send in the handshake (defaults to the host)
        #[arg(long)]
        server_name: Option<String>,
        /// Write raw DER instead of PEM
        #[arg(long)]
        der: bool,
        /// Connect and handshake timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_format)?;

    match args.command {
        Command::Run { config } => run(&config).await,
        Command::Capture {
            address,
            output,
            server_name,
            der,
            timeout,
        } => {
            let format = if der {
                CertificateFormat::Der
            } else {
                CertificateFormat::Pem
            };
            let timeout = (timeout > 0).then(|| Duration::from_secs(timeout));
            capture(&address, &output, server_name.as_deref(), format, timeout).await
        }
    }
}
