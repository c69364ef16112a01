//! appool - application pool server

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use owo_colors::{OwoColorize, Stream::Stderr};

use appool::cli::{Cli, Commands, ConfigArgs, ServeArgs};
use appool::logging;
use appool::paths;
use appool::pool::{PoolConfig, StandardPool};
use appool::server::PoolServer;
use appool::spawn::SpawnServiceClient;
use appool::version;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // The config tool promises full help and exit status 1 on any
            // unrecognized usage; everything else keeps clap's behavior.
            if std::env::args().nth(1).as_deref() == Some("config") {
                print_config_help();
                std::process::exit(1);
            }
            e.exit();
        }
    };

    let result = match &cli.command {
        Commands::Serve(args) => cmd_serve(&cli, args),
        Commands::Config(args) => cmd_config(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Run the pool server until the listener fails.
fn cmd_serve(cli: &Cli, args: &ServeArgs) -> Result<()> {
    logging::init(cli.log_config());

    let spawner = SpawnServiceClient::new(&args.spawn_server)?;
    let config = PoolConfig {
        max: args.max,
        max_per_app: args.max_per_app,
        max_idle: Duration::from_secs(args.max_idle_time),
        ..PoolConfig::default()
    };
    let pool = Arc::new(StandardPool::new(Box::new(spawner), config));
    let server = PoolServer::bind(pool, &args.socket)?;
    server.run()?;
    Ok(())
}

/// Print installation details. With no flag, show help and exit 1.
fn cmd_config(args: &ConfigArgs) -> Result<()> {
    if args.root {
        println!("{}", paths::install_root().display());
    } else if args.version {
        println!("{}", version::full_version());
    } else {
        print_config_help();
        std::process::exit(1);
    }
    Ok(())
}

fn print_config_help() {
    let mut command = Cli::command();
    if let Some(sub) = command.find_subcommand_mut("config") {
        let _ = sub.print_help();
    }
}
