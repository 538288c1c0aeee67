mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tether_session::ResultsMode;

/// Tether -- drive a SAS engine over its standard streams.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
struct Cli {
    /// Configuration file (default: ~/.tether/tether.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine profile to launch
    #[arg(long, global = true)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a program and print its log and results
    Submit {
        /// Results rendering: html or text
        #[arg(long, default_value = "html")]
        results: ResultsMode,

        /// Engine executable, overriding the profile
        #[arg(long)]
        engine: Option<PathBuf>,

        /// Extra engine invocation option (repeatable)
        #[arg(long = "option", allow_hyphen_values = true)]
        options: Vec<String>,

        /// Answer attention prompts by policy instead of asking
        #[arg(long)]
        unattended: bool,

        /// Program file, or - for stdin
        file: PathBuf,
    },

    /// Load a tab-separated file into a table
    Import {
        /// Table to create
        #[arg(long)]
        table: String,

        /// Library the table lives in
        #[arg(long, default_value = "work")]
        libref: String,

        /// Tab-separated file with a header row
        file: PathBuf,
    },

    /// Print a table as tab-separated text
    Export {
        /// Table to read
        #[arg(long)]
        table: String,

        /// Library the table lives in
        #[arg(long, default_value = "work")]
        libref: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing with env filter (e.g., RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let global = commands::Global {
        config: cli.config,
        profile: cli.profile,
    };

    match cli.command {
        Commands::Submit {
            results,
            engine,
            options,
            unattended,
            file,
        } => {
            let args = commands::submit::SubmitArgs {
                mode: results,
                engine,
                options,
                unattended,
                file,
            };
            commands::submit::run(&global, &args)
        }
        Commands::Import {
            table,
            libref,
            file,
        } => commands::import::run(&global, &libref, &table, &file),
        Commands::Export { table, libref } => commands::export::run(&global, &libref, &table),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_parse_submit_defaults() {
        let cli = Cli::try_parse_from(["tether", "submit", "job.sas"]);
        assert!(cli.is_ok(), "should parse submit with defaults: {cli:?}");
        let cli = cli.unwrap();
        assert!(cli.config.is_none());
        match cli.command {
            Commands::Submit {
                results,
                engine,
                options,
                unattended,
                file,
            } => {
                assert_eq!(results, ResultsMode::Html);
                assert!(engine.is_none());
                assert!(options.is_empty());
                assert!(!unattended);
                assert_eq!(file, PathBuf::from("job.sas"));
            }
            _ => panic!("expected Submit command"),
        }
    }

    #[test]
    fn cli_parse_submit_with_overrides() {
        let cli = Cli::try_parse_from([
            "tether",
            "--profile",
            "batch",
            "submit",
            "--results",
            "text",
            "--engine",
            "/opt/sas/bin/sas",
            "--option",
            "-memsize",
            "--option",
            "4G",
            "-",
        ])
        .unwrap();
        assert_eq!(cli.profile.as_deref(), Some("batch"));
        match cli.command {
            Commands::Submit {
                results,
                engine,
                options,
                file,
                ..
            } => {
                assert_eq!(results, ResultsMode::Text);
                assert_eq!(engine, Some(PathBuf::from("/opt/sas/bin/sas")));
                assert_eq!(options, vec!["-memsize", "4G"]);
                assert_eq!(file, PathBuf::from("-"));
            }
            _ => panic!("expected Submit command"),
        }
    }

    #[test]
    fn cli_parse_rejects_unknown_results_mode() {
        let cli = Cli::try_parse_from(["tether", "submit", "--results", "pdf", "job.sas"]);
        assert!(cli.is_err());
    }

    #[test]
    fn cli_parse_import_export() {
        let cli = Cli::try_parse_from(["tether", "import", "--table", "cars", "cars.tsv"]).unwrap();
        match cli.command {
            Commands::Import {
                table,
                libref,
                file,
            } => {
                assert_eq!(table, "cars");
                assert_eq!(libref, "work");
                assert_eq!(file, PathBuf::from("cars.tsv"));
            }
            _ => panic!("expected Import command"),
        }

        let cli = Cli::try_parse_from([
            "tether", "export", "--table", "cars", "--libref", "sashelp", "--config", "t.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("t.toml")));
        match cli.command {
            Commands::Export { table, libref } => {
                assert_eq!(table, "cars");
                assert_eq!(libref, "sashelp");
            }
            _ => panic!("expected Export command"),
        }
    }

    #[test]
    fn cli_parse_import_requires_table() {
        assert!(Cli::try_parse_from(["tether", "import", "cars.tsv"]).is_err());
    }
}
