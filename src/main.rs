use std::net::SocketAddr;
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use anyhow::Context as _;
use clap::Parser;
use kube::api::{Api, ListParams};
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::*;

use example_operator::backoff::RetryPolicy;
use example_operator::controllers::example::reconcilers::desired::WorkloadDefaults;
use example_operator::controllers::example::{self, Settings};
use example_operator::leader::LeaderElection;
use example_operator::resources::examples::Example;
use example_operator::telemetry::{self, LogFormat};
use example_operator::{Metrics, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Log line format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t)]
    log_format: LogFormat,

    /// Address of the health, readiness and metrics server
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: SocketAddr,

    /// Maximum number of Examples reconciled in parallel
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = 4)]
    concurrency: u16,

    #[arg(long, default_value_t = 300)]
    resync_seconds: u64,

    #[arg(long, default_value_t = 30)]
    not_ready_requeue_seconds: u64,

    #[arg(long, default_value_t = 600)]
    permanent_error_requeue_seconds: u64,

    /// Timeout for each call to the API server
    #[arg(long, default_value_t = 10)]
    api_timeout_seconds: u64,

    #[arg(long, default_value_t = 500)]
    backoff_base_millis: u64,

    #[arg(long, default_value_t = 300)]
    backoff_max_seconds: u64,

    /// Image used when an Example does not set spec.image
    #[arg(long, env = "DEFAULT_IMAGE", default_value = "nginx:1.27")]
    default_image: String,

    /// Namespace holding the instance registry and the leader lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    operator_namespace: String,

    #[arg(long, default_value = "example-operator-registry")]
    registry_name: String,

    /// Only reconcile while holding the leader lease
    #[arg(long, env = "LEADER_ELECTION")]
    leader_election: bool,

    #[arg(long, default_value = "example-operator-leader")]
    lease_name: String,

    #[arg(long, default_value_t = 15)]
    lease_duration_seconds: u64,

    #[arg(long, default_value_t = 5)]
    lease_renew_seconds: u64,

    /// Holder identity for the lease, defaults to the hostname
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,
}

impl Arguments {
    fn settings(&self) -> Settings {
        Settings {
            concurrency: self.concurrency,
            resync: Duration::from_secs(self.resync_seconds),
            not_ready_requeue: Duration::from_secs(self.not_ready_requeue_seconds),
            permanent_error_requeue: Duration::from_secs(self.permanent_error_requeue_seconds),
            api_timeout: Duration::from_secs(self.api_timeout_seconds),
            retry: RetryPolicy {
                base: Duration::from_millis(self.backoff_base_millis),
                max: Duration::from_secs(self.backoff_max_seconds),
                ..Default::default()
            },
            workload: WorkloadDefaults {
                image: self.default_image.clone(),
            },
            registry_namespace: self.operator_namespace.clone(),
            registry_name: self.registry_name.clone(),
        }
    }

    fn identity(&self) -> String {
        self.identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| format!("example-operator-{}", std::process::id()))
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok()
            .content_type(encoder.format_type())
            .body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn ready(c: Data<State>, _req: HttpRequest) -> impl Responder {
    if c.is_ready() {
        HttpResponse::Ok().json("ready")
    } else {
        HttpResponse::ServiceUnavailable().json("not ready")
    }
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM: {err}");
                std::future::pending::<()>().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}

// Only called once this replica may reconcile, so followers never read Examples
async fn ensure_crd_installed(client: &Client, state: &State) {
    let examples = Api::<Example>::all(client.clone());
    if let Err(e) = examples.list(&ListParams::default().limit(1)).await {
        error!("Example is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    state.set_ready(true);
}

async fn run_controller(
    client: Client,
    args: &Arguments,
    state: State,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let controller_metrics = Metrics::default()
        .register(&state.registry)
        .context("Failed to register metrics")?;

    if !args.leader_election {
        ensure_crd_installed(&client, &state).await;
        state.set_leader(true).await;
        example::run(client, controller_metrics, state, shutdown).await;
        return Ok(());
    }

    let (leader_tx, mut leader_rx) = watch::channel(false);
    let election = LeaderElection::new(
        client.clone(),
        &args.operator_namespace,
        args.lease_name.clone(),
        args.identity(),
        Duration::from_secs(args.lease_duration_seconds),
        Duration::from_secs(args.lease_renew_seconds),
    );
    let elector = tokio::spawn(election.run(leader_tx, shutdown.clone()));

    info!("Waiting to acquire lease {}", args.lease_name);
    let acquired = tokio::select! {
        _ = shutdown.cancelled() => false,
        res = leader_rx.wait_for(|leader| *leader) => res.is_ok(),
    };

    if acquired {
        ensure_crd_installed(&client, &state).await;
        state.set_leader(true).await;

        // a follower never touches the store, so losing the lease stops everything
        let lost = shutdown.clone();
        tokio::spawn(async move {
            if leader_rx.wait_for(|leader| !*leader).await.is_ok() {
                warn!("Lost leadership, stopping the controller");
            }
            lost.cancel();
        });

        example::run(client, controller_metrics, state.clone(), shutdown.clone()).await;
        state.set_leader(false).await;
    }

    shutdown.cancel();
    elector.await.context("Leader election task panicked")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();
    telemetry::init(args.log_format).context("Failed to initialize logging")?;

    // Initialize Kubernetes controller state
    let state = State::new(args.settings());
    let client = Client::try_default()
        .await
        .context("Failed to create kube client")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    // Start web server
    let server = {
        let state = state.clone();
        HttpServer::new(move || {
            App::new()
                .app_data(Data::new(state.clone()))
                .wrap(middleware::Logger::default().exclude("/healthz").exclude("/readyz"))
                .service(index)
                .service(health)
                .service(ready)
                .service(metrics)
        })
        .bind(args.bind_address)?
        .shutdown_timeout(5)
        .disable_signals()
        .run()
    };
    let server_handle = server.handle();

    let controller = async {
        let res = run_controller(client, &args, state, shutdown).await;
        server_handle.stop(true).await;
        res
    };

    // Both implement graceful shutdown, so poll until both are done
    let (controller, server) = tokio::join!(controller, server);
    server?;
    controller
}
