use clap::{Parser, ValueEnum};

use opnlbd_kubernetes::config::Config;
use opnlbd_kubernetes::controller::server;
use opnlbd_trace::init::TraceConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cmd {
    #[arg(long, help = "Path to kubeconfig; empty for in-cluster")]
    pub kubeconfig: Option<String>,

    #[arg(
        short,
        long,
        required = false,
        default_value = "info",
        help = "Log level(trace, debug, info, warn, error)"
    )]
    pub level: String,

    #[arg(
        value_enum,
        short = 'd',
        long,
        required = false,
        default_value = "plain",
        help = "Log display format"
    )]
    pub format: Format,

    #[arg(short = 'o', long = "log-file", help = "Log output file path")]
    pub log_file: Option<String>,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum Format {
    Plain,
    Json,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Plain => write!(f, "plain"),
            Format::Json => write!(f, "json"),
        }
    }
}

pub fn run() {
    let command = Cmd::parse();

    let trace_config = TraceConfig {
        level: command.level,
        format: command.format.to_string(),
        file: command.log_file,
    };

    let mut config = Config::from_env();
    config.kubeconfig = command.kubeconfig;

    server::start(config, trace_config);
}
