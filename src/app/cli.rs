//! Command-line argument definitions (clap) and help text.

use clap::Parser;

pub const HELP_TEXT: &str = "
Host Error Monitor
Usage: hostfaultd [OPTIONS]

Options:
  -h, --help                    Print help
  -V, --version                 Print version
Config & Debug:
  -c, --config <PATH>           Path to the configuration file
      --log-level <LOG_LEVEL>   Set log level (TRACE, DEBUG, INFO, WARN, ERROR)
      --show-config             Print the effective configuration as JSON and exit
      --test                    Hardware probe mode (report signal lines and sockets, then exit)
";

#[derive(Parser, Debug)]
#[command(name = "hostfaultd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Host Error Monitor", long_about = None)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long, help_heading = "Config & Debug")]
    pub config: Option<String>,

    /// Set log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long = "log-level", help_heading = "Config & Debug")]
    pub log_level: Option<String>,

    /// Print the effective configuration as JSON and exit
    #[arg(long = "show-config", help_heading = "Config & Debug")]
    pub show_config: bool,

    /// Hardware probe mode (report signal lines and sockets, then exit)
    #[arg(long, help_heading = "Config & Debug")]
    pub test: bool,
}
