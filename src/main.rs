//! lendsync - lending protocol data sync from the command line
//!
//! Starts a sync session against the configured endpoints and prints a
//! status report every time the snapshot changes, until Ctrl-C.

use clap::Parser;
use tracing::{error, Level};

use lendsync::cli::{format_snapshot, Cli};
use lendsync::{RpcClient, SyncEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_level(true)
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let result = run(cli).await;
    if let Err(err) = &result {
        error!("{}", err);
    }
    result
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.engine_config()?;
    let engine = SyncEngine::new(RpcClient::new(), config);
    let mut updates = engine.subscribe();

    engine.start(cli.identity()).await;
    print!("{}", format_snapshot(&engine.snapshot()));

    if cli.once {
        engine.stop();
        return Ok(());
    }

    // Drop what piled up during the initial load
    while updates.try_recv().is_ok() {}

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                // Intermediate loading states are not worth a report
                Some(snapshot) if snapshot.is_loading => {}
                Some(snapshot) => println!("\n{}", format_snapshot(&snapshot)),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.stop();
    Ok(())
}
