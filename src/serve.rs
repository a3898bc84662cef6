//! Purpose: Provide the RESP (Redis protocol) TCP server for gedis.
//! Exports: `ServeConfig`, `serve`, `load_packages`.
//! Role: Tokio accept loop; frames commands and hands them to `CommandDispatcher`.
//! Invariants: Replies on one connection are written in request order.
//! Invariants: Dispatch runs on the blocking pool since a pool checkout may wait.
//! Invariants: Framing errors close only the offending connection.
//! Notes: Packages found under `--packages` at startup are added by directory name.

use bytes::BytesMut;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use gedis::api::{
    Error, ErrorKind, LogModule, MemModule, Module, PackageManager, PackageOptions,
};
use gedis::resp::{Command, ReplyBuffer, ReplyWriter, parse_command};

use crate::command_dispatch::CommandDispatcher;

const READ_BUFFER_BYTES: usize = 16 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub packages: Option<PathBuf>,
    pub pool_size: usize,
    pub max_frame_bytes: usize,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let modules: Vec<Arc<dyn Module>> = vec![Arc::new(MemModule::new()), Arc::new(LogModule)];
    let manager = Arc::new(
        PackageManager::new(modules).with_options(PackageOptions::new(config.pool_size)),
    );

    if let Some(dir) = config.packages.clone() {
        let manager = Arc::clone(&manager);
        let loaded = tokio::task::spawn_blocking(move || load_packages(&manager, &dir))
            .await
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("package scan task failed")
                    .with_source(err)
            })??;
        info!(packages = loaded, "startup package scan complete");
    }

    let listener = TcpListener::bind(config.bind).await.map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to bind server")
            .with_hint("Check that the address is free or pick another with --bind.")
            .with_source(err)
    })?;
    let local = listener.local_addr().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read listener address")
            .with_source(err)
    })?;
    info!(addr = %local, pool_size = config.pool_size, "gedis listening");

    let dispatcher = Arc::new(CommandDispatcher::new(manager));
    run_listener(listener, dispatcher, config.max_frame_bytes, shutdown_signal()).await?;
    info!("server stopped");
    Ok(())
}

/// Adds every subdirectory of `dir` as a package named after it.
///
/// An unreadable `dir` is fatal; a package that fails to load is logged and skipped.
pub fn load_packages(manager: &PackageManager, dir: &Path) -> Result<usize, Error> {
    let entries = std::fs::read_dir(dir).map_err(|err| {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Io,
        };
        Error::new(kind)
            .with_message("failed to read packages directory")
            .with_hint("Pass an existing directory to --packages.")
            .with_path(dir)
            .with_source(err)
    })?;

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let mut loaded = 0;
    for path in dirs {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            warn!(path = %path.display(), "skipping package with non UTF-8 name");
            continue;
        };
        match manager.add(name, &path) {
            Ok(()) => loaded += 1,
            Err(err) => error!(
                package = name,
                path = %path.display(),
                error = %err.chain_message(),
                "failed to load package"
            ),
        }
    }
    Ok(loaded)
}

async fn run_listener(
    listener: TcpListener,
    dispatcher: Arc<CommandDispatcher>,
    max_frame_bytes: usize,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Error> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "connection accepted");
                    let dispatcher = Arc::clone(&dispatcher);
                    let stop = stop_rx.clone();
                    connections.spawn(async move {
                        if let Err(err) = handle_connection(stream, dispatcher, max_frame_bytes, stop).await {
                            debug!(peer = %peer, error = %err.chain_message(), "connection failed");
                        }
                        debug!(peer = %peer, "connection closed");
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    let _ = stop_tx.send(true);
    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
    }
    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    dispatcher: Arc<CommandDispatcher>,
    max_frame_bytes: usize,
    mut stop: watch::Receiver<bool>,
) -> Result<(), Error> {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_BYTES);
    loop {
        let mut commands = Vec::new();
        let framing = loop {
            match parse_command(&mut buf, max_frame_bytes) {
                Ok(Some(command)) => commands.push(command),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        let mut reply = if commands.is_empty() {
            ReplyBuffer::new()
        } else {
            dispatch_batch(Arc::clone(&dispatcher), commands).await?
        };
        if let Err(err) = &framing {
            reply.write_error(&format!("ERR {}", err.chain_message()));
        }
        if !reply.is_empty() {
            stream.write_all(reply.as_bytes()).await.map_err(io_error)?;
        }
        if framing.is_err() {
            // The stream cannot be re-synchronized after a framing error.
            return framing;
        }

        tokio::select! {
            read = stream.read_buf(&mut buf) => {
                if read.map_err(io_error)? == 0 {
                    return Ok(());
                }
            }
            _ = stop.changed() => return Ok(()),
        }
    }
}

/// Runs a batch of pipelined commands in order on the blocking pool.
async fn dispatch_batch(
    dispatcher: Arc<CommandDispatcher>,
    commands: Vec<Command>,
) -> Result<ReplyBuffer, Error> {
    tokio::task::spawn_blocking(move || {
        let mut reply = ReplyBuffer::new();
        for command in &commands {
            dispatcher.dispatch(command, &mut reply);
        }
        reply
    })
    .await
    .map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("dispatch task failed")
            .with_source(err)
    })
}

fn io_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("connection i/o failed")
        .with_source(err)
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if config.pool_size == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--pool-size must be greater than zero")
            .with_hint("Use a positive value like 50."));
    }

    if config.max_frame_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-frame-bytes must be greater than zero")
            .with_hint("Use a positive value like 536870912."));
    }

    if let Some(dir) = &config.packages {
        if dir.exists() && !dir.is_dir() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("--packages must name a directory")
                .with_path(dir));
        }
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}
