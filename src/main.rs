use std::process::ExitCode;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use musepa_broker::coap::{RequestDispatcher, Server};
use musepa_broker::config::{build_backend, init_tracing, resolve_bind_addresses, Cli};
use musepa_broker::prefix::PrefixRegistry;
use musepa_broker::BrokerError;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start the async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The whole broker lives on one thread (§5): the dispatcher's
    // registries and backend handle are `Rc`/`RefCell`-based, so every
    // task the event loop spawns runs inside this `LocalSet`.
    let local = tokio::task::LocalSet::new();
    match runtime.block_on(local.run_until(run(cli))) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let addrs = resolve_bind_addresses(&cli.bind_v4, &cli.bind_v6)
        .map_err(BrokerError::from)
        .context("invalid bind address")?;

    let prefixes = match &cli.prefixes {
        Some(path) => PrefixRegistry::from_file(path)
            .map_err(BrokerError::from)
            .with_context(|| format!("failed to load prefix file {}", path.display()))?,
        None => PrefixRegistry::empty(),
    };

    let backend = build_backend(cli.backend, cli.backend_param.as_deref())
        .await
        .map_err(BrokerError::from)
        .context("failed to start backend")?;

    let info_document = std::fs::read(&cli.info).unwrap_or_else(|e| {
        info!(
            "no info document at {} ({}); serving an empty one",
            cli.info.display(),
            e
        );
        Vec::new()
    });

    let dispatcher: Rc<RequestDispatcher> = RequestDispatcher::new(prefixes, backend, info_document);

    let bind_v4 = std::net::SocketAddr::new(addrs.v4, cli.port);
    let bind_v6 = std::net::SocketAddr::new(addrs.v6, cli.port);

    let server = Server::bind(Rc::clone(&dispatcher), bind_v4, Some(bind_v6))
        .await
        .map_err(BrokerError::Bind)
        .context("failed to bind sockets")?;

    info!("musepa broker ready");
    server
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received ctrl-c, shutting down");
        })
        .await;

    Ok(())
}
