//! End-to-end tests over a real TCP socket.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use methq::cache::MethylomeSet;
use methq::index::{metadata_path, CpgIndex, CpgIndexSet};
use methq::methylome::{
    AggregateResult, CountPair, CountsRes, CountsResCov, Methylome, MethylomeMeta,
};
use methq::protocol::{
    decode_counts, encode_offsets, Command, RequestHeader, ResponseHeader, StatusCode,
    RESPONSE_HEADER_BYTES,
};
use methq::server::{Server, ServerOptions, ServerState};

fn write_fixture(dir: &Path) -> Arc<CpgIndexSet> {
    std::fs::write(dir.join("g.fa"), ">chr1\nACGTCGCG\n>chr2\nCG\n").unwrap();
    let index = CpgIndex::from_genome("tiny", &dir.join("g.fa")).unwrap();
    index.write(&dir.join("tiny.cpg_idx")).unwrap();

    let meth = Methylome {
        cpgs: vec![
            CountPair { n_meth: 10, n_unmeth: 0 },
            CountPair { n_meth: 5, n_unmeth: 5 },
            CountPair { n_meth: 0, n_unmeth: 20 },
            CountPair { n_meth: 7, n_unmeth: 3 },
        ],
    };
    let payload = dir.join("SRX1.m16");
    meth.write(&payload, false).unwrap();
    MethylomeMeta::for_methylome(&meth, "tiny", false, false)
        .write(&metadata_path(&payload))
        .unwrap();

    Arc::new(CpgIndexSet::load(dir).unwrap())
}

struct TestServer {
    addr: std::net::SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(dir: &Path) -> TestServer {
        let indexes = write_fixture(dir);
        let methylomes = MethylomeSet::new(
            dir.to_path_buf(),
            4,
            Duration::from_secs(5),
            indexes.clone(),
        );
        let state = Arc::new(ServerState {
            indexes,
            methylomes,
            options: ServerOptions::default(),
        });
        let server = Server::bind("127.0.0.1", 0, state).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });
        TestServer {
            addr,
            shutdown: Some(shutdown),
            task,
        }
    }

    async fn stop(mut self) {
        self.shutdown.take().unwrap().send(()).unwrap();
        self.task.await.unwrap();
    }
}

/// Send one request and collect the response header plus payload.
async fn roundtrip(
    addr: std::net::SocketAddr,
    header_bytes: &[u8],
    body: &[u8],
) -> (ResponseHeader, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(header_bytes).await.unwrap();
    stream.write_all(body).await.unwrap();

    let mut resp_buf = [0u8; RESPONSE_HEADER_BYTES];
    stream.read_exact(&mut resp_buf).await.unwrap();
    let response = ResponseHeader::decode(&resp_buf).unwrap();

    let mut payload = vec![0u8; response.payload_bytes as usize];
    stream.read_exact(&mut payload).await.unwrap();

    // the server half-closes after the payload
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    (response, payload)
}

fn header(command: Command, accession: &str, methylome_size: u32, n_intervals: u32) -> Vec<u8> {
    RequestHeader {
        command,
        accession: accession.to_string(),
        methylome_size,
        n_intervals,
    }
    .encode()
    .unwrap()
    .to_vec()
}

#[tokio::test]
async fn intervals_query_with_coverage() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let offsets = encode_offsets(&[(1, 3), (3, 4)]);
    let (response, payload) = roundtrip(
        server.addr,
        &header(Command::IntervalsCov, "SRX1", 4, 2),
        &offsets,
    )
    .await;

    assert_eq!(response.status, StatusCode::Ok);
    assert!(response.include_coverage);
    assert_eq!(response.n_counts, 2);
    let counts = decode_counts(&payload, true).unwrap();
    assert_eq!(
        counts,
        AggregateResult::Cov(vec![
            CountsResCov { n_meth: 5, n_unmeth: 25, n_covered: 2 },
            CountsResCov { n_meth: 7, n_unmeth: 3, n_covered: 1 },
        ])
    );

    server.stop().await;
}

#[tokio::test]
async fn intervals_query_plain() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let offsets = encode_offsets(&[(0, 4)]);
    let (response, payload) = roundtrip(
        server.addr,
        &header(Command::Intervals, "SRX1", 4, 1),
        &offsets,
    )
    .await;

    assert_eq!(response.status, StatusCode::Ok);
    assert!(!response.include_coverage);
    let counts = decode_counts(&payload, false).unwrap();
    assert_eq!(
        counts,
        AggregateResult::Plain(vec![CountsRes { n_meth: 22, n_unmeth: 28 }])
    );

    server.stop().await;
}

#[tokio::test]
async fn bins_query() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let (response, payload) = roundtrip(
        server.addr,
        &header(Command::BinsCov, "SRX1", 4, 0),
        &4u32.to_be_bytes(),
    )
    .await;

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.n_counts, 3);
    let counts = decode_counts(&payload, true).unwrap();
    assert_eq!(
        counts,
        AggregateResult::Cov(vec![
            CountsResCov { n_meth: 10, n_unmeth: 0, n_covered: 1 },
            CountsResCov { n_meth: 5, n_unmeth: 25, n_covered: 2 },
            CountsResCov { n_meth: 7, n_unmeth: 3, n_covered: 1 },
        ])
    );

    server.stop().await;
}

#[tokio::test]
async fn methylome_size_mismatch_gets_an_error_and_a_clean_close() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let (response, payload) = roundtrip(
        server.addr,
        &header(Command::Intervals, "SRX1", 5, 0),
        &[],
    )
    .await;

    assert_eq!(response.status, StatusCode::MethylomeSizeMismatch);
    assert_eq!(response.n_counts, 0);
    assert!(payload.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn unknown_accession_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let (response, _) = roundtrip(
        server.addr,
        &header(Command::Intervals, "SRX999", 4, 0),
        &[],
    )
    .await;
    assert_eq!(response.status, StatusCode::UnknownAccession);

    server.stop().await;
}

#[tokio::test]
async fn bad_protocol_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let mut bytes = header(Command::Intervals, "SRX1", 4, 0);
    bytes[0..2].copy_from_slice(&7u16.to_be_bytes());
    let (response, _) = roundtrip(server.addr, &bytes, &[]).await;
    assert_eq!(response.status, StatusCode::BadRequest);

    server.stop().await;
}

#[tokio::test]
async fn out_of_range_offsets_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let offsets = encode_offsets(&[(0, 9)]);
    let (response, _) = roundtrip(
        server.addr,
        &header(Command::Intervals, "SRX1", 4, 1),
        &offsets,
    )
    .await;
    assert_eq!(response.status, StatusCode::InvalidOffsets);

    server.stop().await;
}

#[tokio::test]
async fn zero_bin_size_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let (response, _) = roundtrip(
        server.addr,
        &header(Command::Bins, "SRX1", 4, 0),
        &0u32.to_be_bytes(),
    )
    .await;
    assert_eq!(response.status, StatusCode::BadRequest);

    server.stop().await;
}

#[tokio::test]
async fn sequential_requests_reuse_the_resident_methylome() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    for _ in 0..3 {
        let offsets = encode_offsets(&[(0, 4)]);
        let (response, _) = roundtrip(
            server.addr,
            &header(Command::Intervals, "SRX1", 4, 1),
            &offsets,
        )
        .await;
        assert_eq!(response.status, StatusCode::Ok);
    }

    server.stop().await;
}
