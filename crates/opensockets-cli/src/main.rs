use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use opensockets_core::OpensocketsError;
use opensockets_proc::{Reporter, ScanConfig};
use tracing::debug;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Print all listening IPv4 TCP ports on the current system.
///
/// For each listening socket, prints the owning PID, executable name, bound
/// address, port and full command line. Without PIDs, every process is
/// scanned.
#[derive(Parser, Debug)]
#[command(
    name = "opensockets",
    version,
    about,
    long_about = None,
    override_usage = "opensockets [-h] [-v] [-H] [[pid] ...]"
)]
struct Cli {
    /// Process IDs to inspect (default: all processes).
    #[arg(value_name = "PID")]
    pids: Vec<String>,

    /// Don't print the header line.
    #[arg(short = 'H', long = "no-header")]
    no_header: bool,

    /// Increase diagnostic output (repeatable; -d is accepted as an alias).
    #[arg(short = 'v', long = "verbose", short_alias = 'd', action = ArgAction::Count)]
    verbose: u8,

    /// The format for diagnostic output.
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    /// Human-readable text format.
    Text,
    /// Machine-readable JSON format.
    Json,
}

/// Exit codes for opensockets.
mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
}

impl Cli {
    fn scan_config(&self) -> ScanConfig {
        ScanConfig::explicit(self.pids.clone()).with_header(!self.no_header)
    }

    fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::OFF,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

fn parse_args() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                // Help and version go to stdout.
                let _ = err.print();
                std::process::exit(exit_codes::SUCCESS);
            }
            _ => {
                // Bad usage goes to stderr with the usage line.
                let _ = err.print();
                std::process::exit(exit_codes::FAILURE);
            }
        },
    }
}

fn init_logging(cli: &Cli) {
    // Diagnostics share stdout with the results, as -v output always has.
    let filter = EnvFilter::from_default_env().add_directive(cli.log_level().into());

    match cli.log_format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stdout))
                .with(filter)
                .init();
        }
    }
}

fn main() {
    let cli = parse_args();
    init_logging(&cli);

    let config = cli.scan_config();

    match run(&config) {
        Ok(()) => {
            debug!("Scan finished.");
            std::process::exit(exit_codes::SUCCESS);
        }
        Err(err) if err.is_broken_pipe() => std::process::exit(exit_codes::SUCCESS),
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(exit_codes::FAILURE);
        }
    }
}

#[cfg(target_os = "linux")]
fn run(config: &ScanConfig) -> Result<(), OpensocketsError> {
    let host = opensockets_proc::ProcfsHost::new();
    let mut reporter = Reporter::new(std::io::stdout(), std::io::stderr(), config.header);
    let summary = opensockets_proc::run(&host, config, &mut reporter)?;
    debug!(
        processes = summary.processes,
        unreadable = summary.unreadable,
        attach_failures = summary.attach_failures,
        sockets = summary.sockets_reported,
        "summary"
    );
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(config: &ScanConfig) -> Result<(), OpensocketsError> {
    use opensockets_proc::ScanSink;

    let mut reporter = Reporter::new(std::io::stdout(), std::io::stderr(), config.header);
    reporter.begin().map_err(OpensocketsError::output)?;
    Err(OpensocketsError::not_supported(
        "listening socket discovery",
        opensockets_core::get_platform(),
    ))
}
