use clap::error::ErrorKind;
use clap::Parser;
use mapd_server::{Cli, Lifecycle, ServerConfig};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("Usage Error: {}", e);
            return ExitCode::from(1);
        }
    };

    if cli.help_advanced {
        if let Err(e) = Cli::print_advanced_help() {
            eprintln!("{}", e);
            return ExitCode::from(1);
        }
        return ExitCode::SUCCESS;
    }

    if cli.version {
        println!("MapD Version: {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let config = match ServerConfig::resolve(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let result = match Lifecycle::new(config).await {
        Ok(lifecycle) => lifecycle.run().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
