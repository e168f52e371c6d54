use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use culvert_controller::ca::Authority;
use culvert_controller::cnc::{self, CncState};
use culvert_controller::config::ControllerConfig;
use culvert_controller::ingress::{self, IngressMode, IngressState};
use culvert_controller::listener;
use culvert_controller::metrics;
use culvert_controller::routes::RouteTable;
use culvert_controller::serviceauth::ServiceKeySet;
use culvert_controller::session::{SessionConfig, SessionContext};
use culvert_controller::webhook::Notifier;
use culvert_wire::TransactionRegistry;

/// culvert controller: accepts agent tunnel streams and forwards client
/// HTTP over them.
#[derive(Parser)]
#[command(name = "culvert-controller", version)]
struct Cli {
    /// Controller configuration file.
    #[arg(long = "configFile", default_value = "/app/config/config.yaml")]
    config_file: String,
    /// Jaeger collector endpoint, e.g. http://localhost:14268/api/traces.
    #[arg(long = "jaeger-endpoint")]
    jaeger_endpoint: Option<String>,
    /// Log trace spans to stdout.
    #[arg(long = "traceToStdout")]
    trace_to_stdout: bool,
    /// Ratio of traces to create when the incoming request is not traced.
    #[arg(long = "traceRatio", default_value_t = 0.01)]
    trace_ratio: f64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.trace_to_stdout {
        subscriber.with_span_events(FmtSpan::CLOSE).init();
    } else {
        subscriber.init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "controller starting"
    );

    // JAEGER_TRACE_URL wins over the flag when both are set.
    let jaeger = std::env::var("JAEGER_TRACE_URL")
        .ok()
        .or(cli.jaeger_endpoint);
    if let Some(endpoint) = jaeger {
        info!(endpoint = %endpoint, ratio = cli.trace_ratio, "trace export configured");
    }

    // reqwest's rustls build enables a second crypto provider; pin the
    // process-level default before any TLS config is assembled.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = match ControllerConfig::load(&cli.config_file) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "cannot load configuration");
            std::process::exit(1);
        }
    };

    match std::env::var("POD_NAMESPACE") {
        Ok(namespace) => {
            info!(namespace = %namespace, "Kubernetes secret handling enabled");
        }
        Err(_) => info!("POD_NAMESPACE not set, disabling Kubernetes secret handling"),
    }

    let keys = match ServiceKeySet::load(
        &config.service_auth.secrets_path,
        &config.service_auth.current_key_name,
        &config.service_auth.header_mutation_key_name,
    ) {
        Ok(keys) => {
            info!(count = keys.len(), "loaded service keys");
            Arc::new(keys)
        }
        Err(e) => {
            error!(error = %e, "cannot load serviceAuth keys");
            std::process::exit(1);
        }
    };

    let authority = match Authority::load(&config.ca_config.cert_file, &config.ca_config.key_file) {
        Ok(authority) => Arc::new(authority),
        Err(e) => {
            error!(error = %e, "cannot load certificate authority");
            std::process::exit(1);
        }
    };

    info!("generating a server certificate");
    let server_cert = match authority.make_server_cert(&config.server_names) {
        Ok(bundle) => bundle,
        Err(e) => {
            error!(error = %e, "cannot make server certificate");
            std::process::exit(1);
        }
    };

    let prometheus = metrics::install_recorder();
    let table = Arc::new(RouteTable::new());
    let registry = Arc::new(TransactionRegistry::new());
    let notifier = Notifier::new(config.webhook.clone());
    let shutdown = CancellationToken::new();

    let session_ctx = Arc::new(SessionContext {
        table: table.clone(),
        registry: registry.clone(),
        config: SessionConfig::default(),
        notifier,
    });

    // Agent tunnel port.
    let tunnel_acceptor = if config.insecure_agent_connections {
        warn!("insecureAgentConnections is set; agent streams are NOT authenticated");
        None
    } else {
        match authority.tls_acceptor(&server_cert, true) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                error!(error = %e, "cannot build tunnel TLS configuration");
                std::process::exit(1);
            }
        }
    };
    let tunnel_listener = must_bind(config.agent_listen_port).await;
    tokio::spawn(listener::run_agent_tunnel(
        tunnel_listener,
        tunnel_acceptor,
        session_ctx,
        shutdown.clone(),
    ));

    // CNC port (control certificates only).
    let cnc_router = cnc::router(CncState {
        config: config.clone(),
        authority: authority.clone(),
        table: table.clone(),
        keys: keys.clone(),
    });
    let cnc_acceptor = authority
        .tls_acceptor(&server_cert, true)
        .unwrap_or_else(|e| {
            error!(error = %e, "cannot build CNC TLS configuration");
            std::process::exit(1);
        });
    let cnc_listener = must_bind(config.control_listen_port).await;
    tokio::spawn(listener::run_cnc(
        cnc_listener,
        cnc_acceptor,
        cnc_router,
        shutdown.clone(),
    ));

    // The `_services` port: always on, always HTTPS, URL-prefix routing.
    let ingress_acceptor = authority
        .tls_acceptor(&server_cert, false)
        .unwrap_or_else(|e| {
            error!(error = %e, "cannot build ingress TLS configuration");
            std::process::exit(1);
        });
    let services_router = ingress::router(IngressState {
        table: table.clone(),
        registry: registry.clone(),
        keys: keys.clone(),
        mode: IngressMode::Prefixed,
    });
    let services_listener = must_bind(config.service_listen_port).await;
    tokio::spawn(listener::run_https_ingress(
        services_listener,
        ingress_acceptor.clone(),
        services_router,
        shutdown.clone(),
    ));

    // Configured incoming services, each on its own port.
    for service in &config.service_config.incoming_services {
        info!(
            service = %service.name,
            service_type = %service.service_type,
            port = service.port,
            use_http = service.use_http,
            use_google_api_key = service.use_google_api_key,
            has_credentials = service.credentials.is_some(),
            "incoming service"
        );
        let state = IngressState {
            table: table.clone(),
            registry: registry.clone(),
            keys: keys.clone(),
            mode: IngressMode::Service {
                name: service.name.clone(),
                service_type: service.service_type.clone(),
            },
        };
        let router = ingress::router(state);
        let service_listener = must_bind(service.port).await;
        if service.use_http {
            tokio::spawn(listener::run_http_ingress(
                service_listener,
                router,
                shutdown.clone(),
            ));
        } else {
            tokio::spawn(listener::run_https_ingress(
                service_listener,
                ingress_acceptor.clone(),
                router,
                shutdown.clone(),
            ));
        }
    }

    // Outgoing services belong to a separate subsystem; note them so a
    // configured-but-silent block is visible in the logs.
    if !config.service_config.outgoing_services.is_empty() {
        info!(
            count = config.service_config.outgoing_services.len(),
            "outgoingServices configured, not handled by this controller"
        );
    }

    // Prometheus + health.
    let metrics_listener = must_bind(config.prometheus_listen_port).await;
    tokio::spawn(listener::run_http_ingress(
        metrics_listener,
        metrics::router(prometheus),
        shutdown.clone(),
    ));

    info!("controller ready");

    wait_for_shutdown_signal().await;
    info!("shutting down");
    shutdown.cancel();
    info!("exiting cleanly");
}

async fn must_bind(port: u16) -> tokio::net::TcpListener {
    match listener::bind(port).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port, error = %e, "cannot bind listener");
            std::process::exit(1);
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT");
    }
}
