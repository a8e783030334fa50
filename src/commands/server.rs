use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use crate::cache::MethylomeSet;
use crate::config::{CommonArgs, FileConfig, ServerArgs};
use crate::index::CpgIndexSet;
use crate::server::{Server, ServerState};

pub fn run(args: ServerArgs, common: &CommonArgs) -> anyhow::Result<()> {
    let file = FileConfig::load(common.config_file.as_deref())?;
    let host = args.hostname.unwrap_or_else(|| file.host.clone());
    let port = args.port.unwrap_or(file.port);
    let methylome_dir = args.methylome_dir.unwrap_or_else(|| file.methylome_dir.clone());
    let index_dir = args.index_dir.unwrap_or_else(|| file.index_dir.clone());
    let max_resident = args.max_resident.unwrap_or(file.max_resident);
    let n_threads = args.n_threads.unwrap_or(file.n_threads).max(1);

    if args.daemonize {
        daemonize(args.pid_file.as_deref())?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(n_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let indexes = Arc::new(CpgIndexSet::load(&index_dir)?);
        tracing::info!(
            assemblies = ?indexes.assemblies().collect::<Vec<_>>(),
            methylome_dir = %methylome_dir.display(),
            max_resident,
            n_threads,
            "starting server"
        );
        let methylomes = MethylomeSet::new(
            methylome_dir,
            max_resident,
            file.admission_timeout(),
            indexes.clone(),
        );
        let state = Arc::new(ServerState {
            indexes,
            methylomes,
            options: file.server_options(),
        });
        let server = Server::bind(&host, port, state).await?;
        server.run().await?;
        Ok::<(), anyhow::Error>(())
    })
}

/// Double-fork into the background, redirect stdio to /dev/null and write
/// the PID file. Must run before the tokio runtime is built.
fn daemonize(pid_file: Option<&Path>) -> anyhow::Result<()> {
    use nix::unistd::{dup2, fork, setsid, ForkResult};

    if let ForkResult::Parent { .. } = unsafe { fork()? } {
        std::process::exit(0);
    }
    setsid()?;
    if let ForkResult::Parent { .. } = unsafe { fork()? } {
        std::process::exit(0);
    }

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in 0..=2 {
        dup2(devnull.as_raw_fd(), fd)?;
    }

    if let Some(path) = pid_file {
        std::fs::write(path, format!("{}\n", std::process::id()))?;
    }
    Ok(())
}
