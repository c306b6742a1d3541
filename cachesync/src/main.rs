//! Entrypoint of the cachesync binary

use cachesync_logging::{Builder, cli::LoggingConfig, cli::LoggingConfigBuilderExt};
use dotenvy::dotenv;

mod commands {
    pub(crate) mod common;
    pub(crate) mod deliver;
    pub(crate) mod serve;
    pub(crate) mod status;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "cachesync",
    version,
    about = "Keeps the in-process caches of a server farm coherent through a shared instruction log",
    long_about = r#"Keeps the in-process caches of a server farm coherent through a shared instruction log

Examples:
    # Run a server that syncs one cache from a shared directory
    cachesync serve --object-store file --data-dir /mnt/shared/cachesync \
        --refresher 1f0c6a54-5e2b-4a59-8a5e-3c1d8f7b9a10=content

    # Tell every server of the farm to reload entities 12 and 13 of that cache
    cachesync deliver --object-store file --data-dir /mnt/shared/cachesync \
        --refresher 1f0c6a54-5e2b-4a59-8a5e-3c1d8f7b9a10 --refresh-ids 12,13

    # How far behind is a server whose watermark is 40?
    cachesync status --object-store file --data-dir /mnt/shared/cachesync --last-id 40

    # Run a server with full debug logging specified with LOG_FILTER
    LOG_FILTER=debug cachesync serve --object-store file --data-dir /mnt/shared/cachesync
"#
)]
struct Config {
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
#[allow(clippy::large_enum_variant)]
enum Command {
    /// Run the cache sync loop of a server until it is stopped
    Serve(commands::serve::Config),

    /// Append a refresh instruction to the shared log
    Deliver(commands::deliver::Config),

    /// Show the state of the shared log as seen from a watermark
    Status(commands::status::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tokio_runtime.block_on(async move {
        fn handle_init_logs(r: Result<(), cachesync_logging::Error>) {
            if let Err(e) = r {
                eprintln!("Initializing logs failed: {e}");
                std::process::exit(ReturnCode::Failure as _);
            }
        }

        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Serve(config)) => {
                handle_init_logs(init_logs(&config.logging_config, "info"));
                if let Err(e) = commands::serve::command(config).await {
                    eprintln!("Serve command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Deliver(config)) => {
                handle_init_logs(init_logs(
                    &config.logging_config,
                    Builder::DEFAULT_LOG_FILTER,
                ));
                if let Err(e) = commands::deliver::command(config).await {
                    eprintln!("Deliver command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Status(config)) => {
                handle_init_logs(init_logs(
                    &config.logging_config,
                    Builder::DEFAULT_LOG_FILTER,
                ));
                if let Err(e) = commands::status::command(config).await {
                    eprintln!("Status command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // Ignore this - a missing env file is not an error, defaults will
            // be applied when initialising the Config struct.
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(1);
        }
    };
}

fn init_logs(
    config: &LoggingConfig,
    default_log_filter: &str,
) -> Result<(), cachesync_logging::Error> {
    Builder::new()
        .with_default_log_filter(default_log_filter)?
        .with_logging_config(config)?
        .install_global()
}
