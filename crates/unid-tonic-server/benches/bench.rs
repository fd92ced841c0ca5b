use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::{
    net::TcpStream,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tokio::{runtime::Runtime, task::JoinSet};
use tonic::{codec::CompressionEncoding, transport::Channel};
use unid_tonic_core::proto::{SegmentRequest, SnowflakeRequest, id_generator_client::IdGeneratorClient};

const ADDR: &str = "127.0.0.1:50051";
const REQUESTS_PER_TASK: u64 = 1_000;

/// The server binary, killed on drop.
struct ServerProcess(Child);

impl ServerProcess {
    /// Builds and starts the server; the first run may compile it, hence the
    /// long startup deadline.
    fn start() -> Self {
        let child = Command::new("cargo")
            .args(["run", "--release", "--bin", "unid-tonic-server", "--"])
            .args(["--worker-id", "1", "--segment-step", "10000", "--rate-limit-per-sec", "0"])
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("failed to start unid-tonic-server");
        let server = Self(child);

        let deadline = Instant::now() + Duration::from_secs(300);
        while TcpStream::connect(ADDR).is_err() {
            assert!(Instant::now() < deadline, "server did not start on {ADDR}");
            thread::sleep(Duration::from_millis(100));
        }
        server
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[derive(Clone, Copy, Debug)]
enum Call {
    Snowflake,
    Segment,
}

async fn client_task(channel: Channel, call: Call, task: usize, zstd: bool) {
    let mut client = IdGeneratorClient::new(channel);
    if zstd {
        client = client
            .send_compressed(CompressionEncoding::Zstd)
            .accept_compressed(CompressionEncoding::Zstd);
    }
    let key = format!("bench-{}", task % 4);

    for _ in 0..REQUESTS_PER_TASK {
        let response = match call {
            Call::Snowflake => client.snowflake(SnowflakeRequest {}).await,
            Call::Segment => {
                client
                    .segment(SegmentRequest { key: key.clone() })
                    .await
            }
        };
        black_box(response.expect("call failed").into_inner().id);
    }
}

async fn run_round(channel: &Channel, call: Call, concurrency: usize, zstd: bool) {
    let mut tasks = JoinSet::new();
    for task in 0..concurrency {
        tasks.spawn(client_task(channel.clone(), call, task, zstd));
    }
    while let Some(result) = tasks.join_next().await {
        result.expect("client task panicked");
    }
}

fn grpc_bench(c: &mut Criterion) {
    let _server = ServerProcess::start();
    let rt = Runtime::new().expect("failed to build runtime");

    for call in [Call::Snowflake, Call::Segment] {
        let mut group = c.benchmark_group(format!("grpc/{call:?}").to_lowercase());
        for concurrency in [1, 8, 32] {
            for zstd in [false, true] {
                group.throughput(Throughput::Elements(REQUESTS_PER_TASK * concurrency as u64));
                let name = format!(
                    "conc/{concurrency}/comp/{}",
                    if zstd { "zstd" } else { "none" }
                );
                group.bench_function(name, |b| {
                    b.to_async(&rt).iter_custom(|iters| async move {
                        let channel = Channel::from_static("http://127.0.0.1:50051")
                            .connect()
                            .await
                            .expect("failed to connect");
                        let start = Instant::now();
                        for _ in 0..iters {
                            run_round(&channel, call, concurrency, zstd).await;
                        }
                        start.elapsed()
                    });
                });
            }
        }
        group.finish();
    }
}

criterion_group!(grpc_benches, grpc_bench);
criterion_main!(grpc_benches);
