//! Outbound tunnel stream to the controller.
//!
//! The agent dials the controller's tunnel port, presents its client
//! certificate, opens with a `Hello` advertising its endpoint inventory,
//! and then serves the stream: tunneled requests fan out to executors,
//! cancel requests abort them, and a ping/liveness pair mirrors the
//! controller's policy. The connection is held forever; failures reconnect
//! with exponential backoff.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use culvert_wire::{CodecError, Frame, FrameCodec, Hello, TransactionRegistry, TunnelControl};

use crate::config::AgentConfig;
use crate::executor::ExecutorRegistry;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Depth of the outbound frame channel shared by all executors.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("connect: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid controller address {0}")]
    BadAddress(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("TLS setup: {0}")]
    Tls(#[from] rustls::Error),
    #[error("no frame from controller within the liveness window")]
    LivenessExpired,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Connect-and-serve loop; runs until `shutdown` fires.
pub async fn run(
    config: Arc<AgentConfig>,
    executors: Arc<ExecutorRegistry>,
    registry: Arc<TransactionRegistry>,
    shutdown: CancellationToken,
) {
    let mut delay = RECONNECT_DELAY;
    loop {
        info!(controller = %config.controller_hostname, "connecting to controller");
        let outcome = tokio::select! {
            () = shutdown.cancelled() => return,
            outcome = connect_and_run(&config, &executors, &registry, &shutdown) => outcome,
        };
        match outcome {
            Ok(()) => {
                info!("controller stream closed, reconnecting");
                delay = RECONNECT_DELAY;
            }
            Err(e) => {
                warn!(error = %e, delay_secs = delay.as_secs(), "controller connection error");
            }
        }
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
    }
}

async fn connect_and_run(
    config: &AgentConfig,
    executors: &Arc<ExecutorRegistry>,
    registry: &Arc<TransactionRegistry>,
    shutdown: &CancellationToken,
) -> Result<(), TunnelError> {
    let tcp = TcpStream::connect(&config.controller_hostname).await?;

    if config.insecure_controller_connection {
        return run_stream(tcp, config, executors, registry, shutdown).await;
    }

    let connector = tls_connector(config)?;
    let host = config
        .controller_hostname
        .rsplit_once(':')
        .map_or(config.controller_hostname.as_str(), |(host, _)| host);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| TunnelError::BadAddress(config.controller_hostname.clone()))?;
    let tls = connector.connect(server_name, tcp).await?;
    run_stream(tls, config, executors, registry, shutdown).await
}

fn tls_connector(config: &AgentConfig) -> Result<TlsConnector, TunnelError> {
    let mut roots = RootCertStore::empty();
    let ca_pem = std::fs::read(&config.ca_cert_file)?;
    let mut reader = std::io::BufReader::new(&ca_pem[..]);
    for cert in rustls_pemfile::certs(&mut reader) {
        roots
            .add(cert?)
            .map_err(TunnelError::Tls)?;
    }

    let cert_pem = std::fs::read(&config.cert_file)?;
    let mut reader = std::io::BufReader::new(&cert_pem[..]);
    let chain: Vec<_> = rustls_pemfile::certs(&mut reader).collect::<Result<_, _>>()?;
    let key_pem = std::fs::read(&config.key_file)?;
    let mut reader = std::io::BufReader::new(&key_pem[..]);
    let key = rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TunnelError::NoPrivateKey(config.key_file.clone()))?;

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)?;
    Ok(TlsConnector::from(Arc::new(client_config)))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn run_stream<S>(
    stream: S,
    config: &AgentConfig,
    executors: &Arc<ExecutorRegistry>,
    registry: &Arc<TransactionRegistry>,
    shutdown: &CancellationToken,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(stream, FrameCodec::new());
    let (mut sink, mut frames) = framed.split();

    sink.send(Frame::Hello(Hello {
        endpoints: executors.inventory(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        hostname: config.hostname.clone(),
        client_cert: None,
        annotations: vec![],
    }))
    .await?;
    info!(hostname = %config.hostname, "registered with controller");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_DEPTH);
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    let liveness = PING_INTERVAL * 3;
    let mut last_heard = tokio::time::Instant::now();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = sink.close().await;
                return Ok(());
            }
            frame = outbound_rx.recv() => {
                // The sender side is owned here too, so recv never ends.
                if let Some(frame) = frame {
                    sink.send(frame).await?;
                }
            }
            _ = ticker.tick() => {
                // Liveness is checked at ping granularity: a controller
                // silent for 3x the interval drains this stream.
                if last_heard.elapsed() > liveness {
                    return Err(TunnelError::LivenessExpired);
                }
                sink.send(Frame::ping(unix_millis())).await?;
            }
            next = frames.next() => match next {
                None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(frame)) => {
                    last_heard = tokio::time::Instant::now();
                    handle_frame(frame, &outbound_tx, executors, registry);
                }
            }
        }
    }
}

fn handle_frame(
    frame: Frame,
    outbound: &mpsc::Sender<Frame>,
    executors: &Arc<ExecutorRegistry>,
    registry: &Arc<TransactionRegistry>,
) {
    match frame {
        Frame::Ping { ts } => {
            if outbound.try_send(Frame::pong(unix_millis(), ts)).is_err() {
                warn!("pong dropped, outbound queue full");
            }
        }
        Frame::Pong { .. } => {}
        Frame::TunnelControl(TunnelControl::OpenHttpTunnelRequest(req)) => {
            executors.dispatch(req, outbound.clone());
        }
        Frame::TunnelControl(TunnelControl::CancelRequest { id }) => {
            registry.cancel(&id);
        }
        Frame::Hello(_) => {
            warn!("controller sent Hello, dropping");
        }
        Frame::TunnelControl(_) | Frame::Unknown => {
            warn!("unknown frame from controller, dropping");
        }
    }
}
