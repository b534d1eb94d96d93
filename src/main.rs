//! raycore - VMess proxy core

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use raycore::config::Config;
use raycore::error::{Error, Result};
use raycore::Runtime;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        let json = serde_json::to_string_pretty(&Config::example())
            .map_err(|e| Error::Config(format!("Failed to render example config: {}", e)))?;
        println!("{}", json);
        return Ok(());
    }

    let Some(path) = args.config else {
        print_help();
        return Err(Error::Config("No config file specified".into()));
    };

    let config = Config::load(&path)?;

    // RUST_LOG wins over the config file
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    if args.test {
        config.validate()?;
        println!("Configuration OK: {}", path.display());
        return Ok(());
    }

    info!("raycore v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(&config)?;
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
#[derive(Default)]
struct Args {
    config: Option<PathBuf>,
    test: bool,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let mut parsed = Args::default();
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => parsed.config = args.next().map(PathBuf::from),
                "-t" | "--test" => parsed.test = true,
                "--gen-config" => parsed.gen_config = true,
                "-v" | "--version" => parsed.version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                // A bare path is the config file
                other if !other.starts_with('-') && parsed.config.is_none() => {
                    parsed.config = Some(PathBuf::from(other));
                }
                other => eprintln!("Ignoring unknown argument: {}", other),
            }
        }
        parsed
    }
}

fn print_help() {
    println!(
        r#"raycore - VMess proxy core

USAGE:
    raycore [OPTIONS] -c <FILE>

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -t, --test              Validate the configuration and exit
        --gen-config        Print an example configuration
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    raycore -c config.json
    raycore --gen-config > config.json

ENVIRONMENT:
    RUST_LOG                Log level (trace, debug, info, warn, error)
"#
    );
}

fn print_version() {
    println!("raycore v{}", env!("CARGO_PKG_VERSION"));
}
