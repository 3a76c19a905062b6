use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("duration cannot be empty (expected e.g. 10s, 250ms, 1m)".to_string());
    }

    // Bare numbers are seconds, like durations in the script.
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    humantime::parse_duration(s)
        .map_err(|err| format!("invalid duration '{s}' (expected e.g. 10s, 250ms, 1m): {err}"))
}

fn parse_positive(input: &str) -> Result<usize, String> {
    match input.trim().parse::<usize>() {
        Ok(0) => Err("must be greater than zero".to_string()),
        Ok(v) => Ok(v),
        Err(err) => Err(format!("invalid number '{input}': {err}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable interval lines and summary.
    HumanReadable,
    /// Emit JSON lines (NDJSON) to stdout: one per interval plus the final report.
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "volley",
    author,
    version,
    about = "Phase-driven load generator",
    long_about = "volley drives virtual users through scripted scenarios according to a list of arrival phases and aggregates the metrics they emit.\n\nA script is a YAML document with `phases`, `scenarios` and optional `plugins`. The built-in `synthetic` engine simulates latency and failures without network I/O.",
    after_help = "Examples:\n  volley run demos/synthetic.yml\n  volley run demos/synthetic.yml --workers 4 --flush-interval 5s\n  volley run demos/synthetic.yml --output json\n\nSet RUST_LOG to control log verbosity (default: warn)."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load test script
    #[command(
        long_about = "Run a YAML script: schedule arrivals per phase, execute scenarios and print the aggregate report.\n\nCLI flags override the run defaults."
    )]
    Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the script (.yml / .yaml)
    pub script: PathBuf,

    /// Number of workers executing virtual users
    #[arg(long, value_parser = parse_positive)]
    pub workers: Option<usize>,

    /// Run-wide cap on concurrently active virtual users
    #[arg(long)]
    pub max_vusers: Option<u64>,

    /// Reporting interval (e.g. 10s, 500ms)
    #[arg(long, value_parser = parse_duration)]
    pub flush_interval: Option<Duration>,

    /// How long in-flight virtual users may keep running after Ctrl-C
    #[arg(long, value_parser = parse_duration)]
    pub grace: Option<Duration>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::HumanReadable)]
    pub output: OutputFormat,

    /// Log at info level unless RUST_LOG is set
    #[arg(long, short)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_accepts_common_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("1m"), Ok(Duration::from_secs(60)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(2 * 60 * 60)));
        assert_eq!(parse_duration("5"), Ok(Duration::from_secs(5)));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn cli_parses_run_overrides() {
        let parsed = Cli::try_parse_from([
            "volley",
            "run",
            "load.yml",
            "--workers",
            "3",
            "--max-vusers",
            "50",
            "--flush-interval",
            "500ms",
            "--output",
            "json",
            "-v",
        ]);

        let cli = match parsed {
            Ok(v) => v,
            Err(err) => panic!("failed to parse args: {err}"),
        };

        let Command::Run(args) = cli.command;
        assert_eq!(args.script, PathBuf::from("load.yml"));
        assert_eq!(args.workers, Some(3));
        assert_eq!(args.max_vusers, Some(50));
        assert_eq!(args.flush_interval, Some(Duration::from_millis(500)));
        assert_eq!(args.grace, None);
        assert_eq!(args.output, OutputFormat::Json);
        assert!(args.verbose);
    }

    #[test]
    fn cli_defaults_to_human_output() {
        let cli = match Cli::try_parse_from(["volley", "run", "load.yml"]) {
            Ok(v) => v,
            Err(err) => panic!("failed to parse args: {err}"),
        };
        let Command::Run(args) = cli.command;
        assert_eq!(args.output, OutputFormat::HumanReadable);
        assert!(!args.verbose);
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(Cli::try_parse_from(["volley", "run", "x.yml", "--workers", "0"]).is_err());
    }
}
