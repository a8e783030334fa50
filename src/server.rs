//! Query server: accept loop and per-connection state machine.
//!
//! Each accepted socket becomes one task owning its connection. The task
//! walks the request stages in order (read header, validate, read body,
//! compute, write header, write counts) with a timeout per stage and one
//! deadline over the whole request; any validation failure short-circuits
//! to an error response, any I/O failure drops the connection. Aggregation
//! runs on the resuming worker thread, yielding between chunks so large
//! requests cannot starve other connections.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::cache::{MethylomeSet, ResidentMethylome};
use crate::index::{CpgIndex, CpgIndexSet};
use crate::methylome::{AggregateResult, CountsResCov};
use crate::protocol::{
    decode_offsets, encode_counts, validate_offsets, RequestHeader, ResponseHeader, StatusCode,
    REQUEST_HEADER_BYTES,
};
use crate::{Error, Result};

/// Offset pairs aggregated between yields on interval requests.
const KERNEL_CHUNK: usize = 65_536;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub request_deadline: Duration,
    pub grace_period: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            request_deadline: Duration::from_secs(60),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Shared state: the read-only index set and the guarded methylome cache.
pub struct ServerState {
    pub indexes: Arc<CpgIndexSet>,
    pub methylomes: MethylomeSet,
    pub options: ServerOptions,
}

/// Cloneable trigger for a graceful drain; usable before or during `run`.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<tokio::sync::Notify>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.notify_one();
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl Server {
    pub async fn bind(host: &str, port: u16, state: Arc<ServerState>) -> Result<Server> {
        let listener = TcpListener::bind((host, port)).await?;
        tracing::info!(host, port, "listening");
        Ok(Server {
            listener,
            state,
            shutdown: Arc::new(tokio::sync::Notify::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Serve until interrupted or [`ShutdownHandle::shutdown`] fires, then
    /// drain within the grace period.
    pub async fn run(self) -> Result<()> {
        let notify = self.shutdown.clone();
        self.run_until(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = notify.notified() => {}
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();
        let mut next_id = 0u64;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_id += 1;
                        let state = self.state.clone();
                        connections.spawn(handle_connection(stream, peer, state, next_id));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        let pending = connections.len();
        if pending > 0 {
            tracing::info!(pending, "draining connections");
            let drained = timeout(self.state.options.grace_period, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!("grace period expired, aborting remaining connections");
                connections.shutdown().await;
            }
        }
        tracing::info!("server stopped");
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    conn_id: u64,
) {
    tracing::debug!(conn_id, %peer, "connection accepted");
    match timeout(
        state.options.request_deadline,
        serve_request(&mut stream, &state, conn_id),
    )
    .await
    {
        Ok(Ok(())) => tracing::debug!(conn_id, "request complete"),
        Ok(Err(e)) => tracing::warn!(conn_id, error = %e, "connection aborted"),
        Err(_) => tracing::warn!(conn_id, "request deadline expired"),
    }
    let _ = stream.shutdown().await;
}

/// One request, start to finish. `Err` means the connection died mid-stage;
/// protocol-level failures are answered with an error header and are `Ok`.
async fn serve_request(stream: &mut TcpStream, state: &ServerState, conn_id: u64) -> Result<()> {
    let opts = &state.options;

    let mut header_buf = [0u8; REQUEST_HEADER_BYTES];
    read_stage(stream, &mut header_buf, opts.read_timeout).await?;
    let header = match RequestHeader::decode(&header_buf) {
        Ok(header) => header,
        Err(e) => return respond_error(stream, conn_id, &e, opts.write_timeout).await,
    };
    tracing::debug!(
        conn_id,
        accession = %header.accession,
        command = ?header.command,
        n_intervals = header.n_intervals,
        "request header"
    );

    let (resident, index) = match resolve(state, &header).await {
        Ok(resolved) => resolved,
        Err(e) => return respond_error(stream, conn_id, &e, opts.write_timeout).await,
    };

    let result = if header.command.is_bins() {
        let mut buf = [0u8; 4];
        read_stage(stream, &mut buf, opts.read_timeout).await?;
        let bin_size = u32::from_be_bytes(buf);
        if bin_size == 0 {
            let e = Error::BadRequest("bin size must be positive".to_string());
            return respond_error(stream, conn_id, &e, opts.write_timeout).await;
        }
        compute_bins(&resident, &index, bin_size, header.command.include_coverage()).await
    } else {
        let mut buf = vec![0u8; header.n_intervals as usize * 8];
        read_stage(stream, &mut buf, opts.read_timeout).await?;
        let offsets = match decode_offsets(&buf) {
            Ok(offsets) => offsets,
            Err(e) => return respond_error(stream, conn_id, &e, opts.write_timeout).await,
        };
        if let Err(e) = validate_offsets(&offsets, index.meta.n_cpgs_total) {
            return respond_error(stream, conn_id, &e, opts.write_timeout).await;
        }
        compute_intervals(&resident, &offsets, header.command.include_coverage()).await
    };

    let payload = encode_counts(&result);
    let response = ResponseHeader {
        status: StatusCode::Ok,
        include_coverage: result.include_coverage(),
        n_counts: result.len() as u32,
        payload_bytes: payload.len() as u32,
    };
    write_stage(stream, &response.encode(), opts.write_timeout).await?;
    write_stage(stream, &payload, opts.write_timeout).await?;
    tracing::info!(
        conn_id,
        accession = %header.accession,
        n_counts = result.len(),
        "responded"
    );
    Ok(())
}

/// Locate the methylome and its assembly's index, then cross-check the
/// client's view of the methylome size.
async fn resolve(
    state: &ServerState,
    header: &RequestHeader,
) -> Result<(Arc<ResidentMethylome>, Arc<CpgIndex>)> {
    let resident = state.methylomes.get(&header.accession).await?;
    let index = state
        .indexes
        .get(&resident.meta.assembly)
        .ok_or_else(|| Error::UnknownAssembly(resident.meta.assembly.clone()))?;
    if header.methylome_size != index.meta.n_cpgs_total {
        return Err(Error::MethylomeSizeMismatch {
            got: header.methylome_size,
            expected: index.meta.n_cpgs_total,
        });
    }
    Ok((resident, index))
}

async fn compute_intervals(
    resident: &ResidentMethylome,
    offsets: &[(u32, u32)],
    include_coverage: bool,
) -> AggregateResult {
    if include_coverage {
        let mut rows = Vec::with_capacity(offsets.len());
        for chunk in offsets.chunks(KERNEL_CHUNK) {
            rows.extend(resident.methylome.get_counts_cov(chunk));
            if offsets.len() > KERNEL_CHUNK {
                tokio::task::yield_now().await;
            }
        }
        AggregateResult::Cov(rows)
    } else {
        let mut rows = Vec::with_capacity(offsets.len());
        for chunk in offsets.chunks(KERNEL_CHUNK) {
            rows.extend(resident.methylome.get_counts(chunk));
            if offsets.len() > KERNEL_CHUNK {
                tokio::task::yield_now().await;
            }
        }
        AggregateResult::Plain(rows)
    }
}

async fn compute_bins(
    resident: &ResidentMethylome,
    index: &CpgIndex,
    bin_size: u32,
    include_coverage: bool,
) -> AggregateResult {
    let mut rows: Vec<CountsResCov> = Vec::with_capacity(index.n_bins(bin_size) as usize);
    for ch_id in 0..index.n_chroms() {
        rows.extend(resident.methylome.chrom_bins_cov(ch_id, bin_size, index));
        tokio::task::yield_now().await;
    }
    if include_coverage {
        AggregateResult::Cov(rows)
    } else {
        AggregateResult::Plain(rows.into_iter().map(CountsResCov::drop_coverage).collect())
    }
}

async fn respond_error(
    stream: &mut TcpStream,
    conn_id: u64,
    error: &Error,
    write_timeout: Duration,
) -> Result<()> {
    let status = error.status_code();
    tracing::warn!(conn_id, %status, error = %error, "responding with error");
    let response = ResponseHeader::error(status);
    write_stage(stream, &response.encode(), write_timeout).await
}

async fn read_stage(stream: &mut TcpStream, buf: &mut [u8], dur: Duration) -> Result<()> {
    match timeout(dur, stream.read_exact(buf)).await {
        Ok(read) => {
            read?;
            Ok(())
        }
        Err(_) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "read stage timed out",
        ))),
    }
}

async fn write_stage(stream: &mut TcpStream, bytes: &[u8], dur: Duration) -> Result<()> {
    match timeout(dur, stream.write_all(bytes)).await {
        Ok(written) => {
            written?;
            Ok(())
        }
        Err(_) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write stage timed out",
        ))),
    }
}
