use std::env;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::rustls::ServerConfig as TlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use minutely::aggregate::aggregator::Aggregator;
use minutely::aggregate::flusher::FlushScheduler;
use minutely::app_state::AppState;
use minutely::clock::Clock;
use minutely::config::{Config, HttpConfig};
use minutely::db::provision::SchemaProvisioner;
use minutely::db::upsert::BatchedUpserter;
use minutely::db::DbPool;
use minutely::errors::ConfigError;
use minutely::handlers;
use minutely::names::metrics::MetricNames;
use minutely::names::slices::SliceNames;
use minutely::utils::tracing::init_tracing;

const DEFAULT_CONFIG_PATH: &str = "./minutely.yaml";

// ---------------------------------------------------------------------------
// Configuration loading
// ---------------------------------------------------------------------------

/// Load and parse the YAML configuration file.
///
/// The path is read from `MINUTELY_CONFIG_PATH` (env) or falls back to
/// `./minutely.yaml`.
fn load_config() -> Result<Config, ConfigError> {
    let path = env::var("MINUTELY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    eprintln!("loading configuration from {}", path);
    Config::load(&path)
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

fn build_tls_acceptor(http: &HttpConfig) -> Result<Option<TlsAcceptor>, ConfigError> {
    if !http.tls_enabled {
        return Ok(None);
    }
    let cert_path = http
        .tls_cert_file_path
        .as_deref()
        .ok_or_else(|| ConfigError::Tls("tls_cert_file_path is required when tls is enabled".into()))?;
    let key_path = http
        .tls_key_file_path
        .as_deref()
        .ok_or_else(|| ConfigError::Tls("tls_key_file_path is required when tls is enabled".into()))?;

    let cert_file = File::open(cert_path)
        .map_err(|e| ConfigError::Tls(format!("cannot open {cert_path}: {e}")))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("cannot parse {cert_path}: {e}")))?;

    let key_file = File::open(key_path)
        .map_err(|e| ConfigError::Tls(format!("cannot open {key_path}: {e}")))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ConfigError::Tls(format!("cannot parse {key_path}: {e}")))?
        .ok_or_else(|| ConfigError::Tls(format!("no private key found in {key_path}")))?;

    let tls_config = TlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Tls(e.to_string()))?;
    Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
}

// ---------------------------------------------------------------------------
// Request routing
// ---------------------------------------------------------------------------

/// Route an incoming HTTP request to the appropriate handler.
async fn route(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path().to_string();

    match (req.method(), path.as_str()) {
        (&Method::GET, "/ping") => Ok(handlers::ping()),
        (&Method::POST, "/track") => handlers::track::handle_track(req, state).await,
        _ => {
            debug!(method = %req.method(), path = %path, "no route found");
            let mut not_found = Response::new(handlers::empty_body());
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

/// Accept connections and spawn a task per connection.
///
/// Listens for `SIGINT` / `ctrl-c` and returns once it fires, so the caller
/// can flush the in-memory counters after accepting has stopped.
async fn run_server(state: Arc<AppState>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bind_address = state.config.http.bind_address();
    let listener = TcpListener::bind(&bind_address).await?;
    let tls_acceptor = build_tls_acceptor(&state.config.http)?;
    info!(address = %bind_address, tls = tls_acceptor.is_some(), "server listening");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = result?;
                let state = Arc::clone(&state);
                let acceptor = tls_acceptor.clone();

                tokio::task::spawn(async move {
                    debug!(peer = ?peer_addr, "accepted connection");

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { route(req, state).await }
                    });

                    let served = match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                http1::Builder::new()
                                    .serve_connection(TokioIo::new(tls_stream), service)
                                    .await
                            }
                            Err(err) => {
                                warn!(peer = ?peer_addr, error = ?err, "tls handshake failed");
                                return;
                            }
                        },
                        None => {
                            http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                        }
                    };
                    if let Err(err) = served {
                        warn!(error = ?err, "error serving connection");
                    }
                });
            }
            _ = &mut shutdown => {
                info!("received shutdown signal, stopping server");
                break;
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = load_config()?;
    init_tracing(config.http.mode);

    let clock = Arc::new(Clock::new(&config.time_zone)?);
    let pool = DbPool::new(&config.db)?;

    let metric_names = Arc::new(MetricNames::new(pool.clone()));
    let slice_names = Arc::new(SliceNames::new(pool.clone()));
    let aggregator = Arc::new(Aggregator::new(
        clock,
        Arc::clone(&metric_names),
        Arc::clone(&slice_names),
        &config,
    )?);

    metric_names.warm_up(aggregator.metric_reject()).await?;
    slice_names.warm_up(aggregator.slice_reject()).await?;

    let provisioner = Arc::new(SchemaProvisioner::new(pool.clone()));
    let upserter = Arc::new(BatchedUpserter::new(pool));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flushers = FlushScheduler::start(
        Arc::clone(&aggregator),
        provisioner,
        upserter,
        Duration::from_secs(config.flush_to_db_interval),
        Duration::from_secs(config.flush_totals_interval),
        shutdown_rx,
    );

    let state = Arc::new(AppState { config, aggregator });
    run_server(state).await?;

    // Accepting has stopped; drain what is still in memory before exit.
    let _ = shutdown_tx.send(true);
    flushers.join().await;
    info!("shutdown complete");
    Ok(())
}
