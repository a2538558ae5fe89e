use std::env;
use std::io;
use std::process::ExitCode;

use ledger_core::csv::{read_commands, write_balances};
use ledger_core::model::Command;
use ledger_core::{Config, Ledger, MemoryStore, Store};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let path = env::args()
        .nth(1)
        .expect("usage: ledger-core <commands.csv>");

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    #[cfg(feature = "postgres")]
    if let Some(url) = config.database_url.as_deref() {
        let store = match ledger_core::store::PostgresStore::connect(
            url,
            config.max_connections,
            config.lock_timeout,
        )
        .await
        {
            Ok(store) => store,
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = store.migrate().await {
            error!("{e}");
            return ExitCode::FAILURE;
        }
        return run(Ledger::new(store), path).await;
    }

    run(
        Ledger::new(MemoryStore::with_lock_timeout(config.lock_timeout)),
        path,
    )
    .await
}

async fn run<S: Store>(ledger: Ledger<S>, path: String) -> ExitCode {
    let commands = match read_commands(path) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (command_sender, command_receiver) = tokio::sync::mpsc::channel::<Command>(16);

    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    if command_sender.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    let opened = ledger.run(ReceiverStream::new(command_receiver)).await;

    let mut balances = Vec::with_capacity(opened.len());
    for account in &opened {
        match ledger.get_account_balance(account).await {
            Ok(balance) => balances.push(balance),
            Err(e) => warn!(account = %account, "{e}"),
        }
    }

    if let Err(e) = write_balances(io::stdout().lock(), balances) {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
