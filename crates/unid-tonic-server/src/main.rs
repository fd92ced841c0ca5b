#![doc = include_str!("../README.md")]

mod server;

use anyhow::Context;
use clap::Parser;
use core::time::Duration;
use futures::Stream;
use server::config::{CliArgs, ServerConfig};
use server::service::handler::IdService;
use server::telemetry::init_telemetry;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal;
use tonic::transport::server::Connected;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use unid_tonic_core::proto::{FILE_DESCRIPTOR_SET, id_generator_server::IdGeneratorServer};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type IdServer = IdGeneratorServer<IdService>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = ServerConfig::try_from(CliArgs::parse())?;

    let providers = init_telemetry()?;
    let service = IdService::from_config(&config).await?;
    announce(&config);

    let result = if config.uds {
        serve_uds(service, &config).await
    } else {
        serve_tcp(service, &config).await
    };

    // Flush after the last request has been answered.
    providers.shutdown();
    result
}

async fn serve_tcp(service: IdService, config: &ServerConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening on tcp");
    let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
    serve(service, incoming, config.shutdown_timeout).await
}

#[cfg(unix)]
async fn serve_uds(service: IdService, config: &ServerConfig) -> anyhow::Result<()> {
    let path = &config.server_addr;
    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind unix socket {path}"))?;
    tracing::info!(path = %path, "listening on unix socket");
    let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);
    let result = serve(service, incoming, config.shutdown_timeout).await;
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path, error = %e, "could not remove socket file");
    }
    result
}

#[cfg(not(unix))]
async fn serve_uds(_service: IdService, _config: &ServerConfig) -> anyhow::Result<()> {
    anyhow::bail!("Unix domain sockets are not supported on this platform")
}

async fn serve<I, IO, IE>(
    service: IdService,
    incoming: I,
    drain_timeout: Duration,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    let (health, health_service) = tonic_health::server::health_reporter();
    health.set_serving::<IdServer>().await;

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(ServiceBuilder::new().layer(cors).layer(GrpcWebLayer::new()))
        .add_service(health_service)
        .add_service(reflection)
        .add_service(id_server(service.clone()))
        .serve_with_incoming_shutdown(incoming, drain_on_signal(service, health, drain_timeout))
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

fn id_server(service: IdService) -> IdServer {
    [
        CompressionEncoding::Zstd,
        CompressionEncoding::Gzip,
        CompressionEncoding::Deflate,
    ]
    .into_iter()
    .fold(IdGeneratorServer::new(service), |server, encoding| {
        server.send_compressed(encoding).accept_compressed(encoding)
    })
}

fn announce(config: &ServerConfig) {
    tracing::info!(
        datacenter_id = config.identity.datacenter_id(),
        worker_id = config.identity.worker_id(),
        store = ?config.store,
        "starting ID service"
    );
    tracing::debug!(?config, "resolved configuration");
}

/// Resolves once a shutdown has been requested and the service has drained.
async fn drain_on_signal(service: IdService, health: HealthReporter, timeout: Duration) {
    let signal = wait_for_signal().await;
    tracing::info!(signal, "shutting down");

    health.set_not_serving::<IdServer>().await;
    if !service.shutdown(timeout).await {
        tracing::error!(?timeout, "requests still in flight at shutdown");
    }
}

async fn wait_for_signal() -> &'static str {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => "SIGINT",
        () = terminate => "SIGTERM",
    }
}
