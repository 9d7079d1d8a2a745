//! Taintwatch CLI: run a script under dynamic taint analysis and report.

use clap::Parser as ClapParser;
use std::path::PathBuf;
use taintwatch_cli::colors::{red, verdict_label, yellow};
use taintwatch_cli::{analyse, AnalysisOptions, EXIT_ERROR};
use tracing_subscriber::EnvFilter;

#[derive(ClapParser)]
#[command(name = "taintwatch", version, about = "Dynamic taint analysis for bytecode scripts")]
struct Cli {
    /// Program to analyse (.twasm assembler text or a .json code object)
    #[arg()]
    file: PathBuf,

    /// Runtime options, e.g. `run_mode=debug,jump_branch=true`
    #[arg(short, long)]
    options: Option<String>,

    /// Settings file with a [runtime] table and extra source/sink/override records
    #[arg(long)]
    config: Option<PathBuf>,

    /// Line served to input(); repeat for more lines
    #[arg(long = "stdin", value_name = "LINE")]
    stdin: Vec<String>,

    /// Environment variable visible to the script as KEY=VALUE
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Stop the script after this many instructions
    #[arg(long)]
    max_instructions: Option<u64>,

    /// Print a one-line summary to stderr
    #[arg(long)]
    summary: bool,

    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,

    /// Script arguments, visible as sys.argv[1:]
    #[arg(last = true)]
    args: Vec<String>,
}

fn parse_env(item: &str) -> Result<(String, String), String> {
    item.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", item))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "taintwatch=debug" } else { "taintwatch=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let options = AnalysisOptions {
        options: cli.options,
        config: cli.config,
        stdin: cli.stdin,
        args: cli.args,
        env: cli.env,
        instruction_limit: cli.max_instructions,
    };

    let analysis = match analyse(&cli.file, &options) {
        Ok(analysis) => analysis,
        Err(e) => {
            eprintln!("{} {}", red("error:"), e);
            std::process::exit(EXIT_ERROR);
        }
    };

    for record in &analysis.traces {
        match serde_json::to_string(record) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("{} unserializable trace record: {}", yellow("warning:"), e),
        }
    }
    println!("{}", analysis.report.to_json());

    if let Some(err) = &analysis.error {
        eprintln!("{} {}", red("error:"), err);
    }
    if cli.summary {
        let desc = analysis.report.desc.as_deref().unwrap_or("no finding");
        eprintln!("{} {} ({})", verdict_label(analysis.report.is_malicious), analysis.report.file_name, desc);
    }
    std::process::exit(analysis.exit_code());
}
