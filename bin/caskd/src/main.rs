// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use slog::{info, o, Drain};

use caskd::migrate;
use caskd::server::{self, DaemonContext};

#[derive(Debug, Parser)]
#[clap(about, version)]
/// The cask container manager daemon
enum Args {
    /// Runs the migration websocket endpoint.
    Run {
        #[clap(name = "IP:PORT", action)]
        listen_addr: SocketAddr,

        /// Externally reachable base URL advertised in operation URLs;
        /// defaults to the listen address over https.
        #[clap(long, action)]
        base_url: Option<String>,
    },

    /// Relays a live-migration restore verdict back into the checkpoint
    /// tool's action script. Invoked by the daemon itself, not by users.
    #[clap(hide = true)]
    Migratedumpsuccess {
        #[clap(action)]
        op_url: String,

        #[clap(action)]
        secret: String,
    },
}

fn build_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, o!())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    match Args::parse() {
        Args::Run { listen_addr, base_url } => {
            let log = build_logger();
            let exec_path = std::env::current_exe()
                .map_err(|e| anyhow!("failed to resolve our executable path: {}", e))?;
            let base_url = base_url.unwrap_or_else(|| format!("https://{listen_addr}"));
            let ctx = Arc::new(DaemonContext::new(log.clone(), exec_path, base_url));

            info!(log, "starting server...");
            server::serve(ctx, listen_addr)
                .await
                .map_err(|e| anyhow!("server exited with an error: {}", e))?;
            Ok(ExitCode::SUCCESS)
        }

        Args::Migratedumpsuccess { op_url, secret } => {
            // The exit code feeds straight back into the checkpoint
            // tool: 0 kills the dumped container, 1 leaves it running.
            match migrate::migrate_dump_success(&op_url, &secret).await {
                Ok(true) => Ok(ExitCode::SUCCESS),
                Ok(false) | Err(_) => Ok(ExitCode::FAILURE),
            }
        }
    }
}
