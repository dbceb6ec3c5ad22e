//! lambda-mesh - sidecar extension and catalog registrator

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lambda_mesh::extension::runtime_api::{EventProcessor, RuntimeClient};
use lambda_mesh::extension::{Extension, ExtensionConfig};
use lambda_mesh::functions::LambdaApiClient;
use lambda_mesh::mesh::HttpMeshClient;
use lambda_mesh::registrator::{Environment, RegistratorConfig};
use lambda_mesh::store::{ParamStore, SsmStore};
use lambda_mesh::Result;

const EXTENSION_NAME: &str = "lambda-mesh-extension";

/// lambda-mesh - bridge AWS Lambda functions into a Consul service mesh
#[derive(Parser, Debug)]
#[command(name = "lambda-mesh", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sidecar extension (proxy, credential refresh, event pump)
    Extension(ExtensionArgs),

    /// Run one reconciliation of the function inventory into the mesh
    Registrator(RegistratorArgs),
}

/// Extension mode arguments
#[derive(Args, Debug)]
struct ExtensionArgs {
    /// host:port of the mesh gateway all upstream traffic dials through
    #[arg(long, env = "CONSUL_MESH_GATEWAY_URI")]
    mesh_gateway_uri: String,

    /// Parameter-store prefix holding this function's mTLS material
    #[arg(long, env = "CONSUL_EXTENSION_DATA_PREFIX")]
    extension_data_prefix: String,

    /// Namespace of the local service (enterprise only)
    #[arg(long, env = "CONSUL_SERVICE_NAMESPACE", default_value = "")]
    service_namespace: String,

    /// Partition of the local service (enterprise only)
    #[arg(long, env = "CONSUL_SERVICE_PARTITION", default_value = "")]
    service_partition: String,

    /// Comma-separated upstream descriptors: name[.ns[.ap]]:port[:dc]
    #[arg(
        long,
        env = "CONSUL_SERVICE_UPSTREAMS",
        value_delimiter = ',',
        default_value = ""
    )]
    upstreams: Vec<String>,

    /// How often to re-fetch mTLS material (e.g. 5m, 30s)
    #[arg(
        long,
        env = "CONSUL_REFRESH_FREQUENCY",
        default_value = "5m",
        value_parser = parse_duration
    )]
    refresh_frequency: Duration,

    /// How long to wait for the proxy listeners to come up
    #[arg(
        long,
        env = "CONSUL_EXTENSION_PROXY_TIMEOUT",
        default_value = "3s",
        value_parser = parse_duration
    )]
    proxy_timeout: Duration,

    /// Local service name; the runtime provides it to every function
    #[arg(long, env = "AWS_LAMBDA_FUNCTION_NAME", default_value = "")]
    service_name: String,
}

/// Registrator mode arguments
#[derive(Args, Debug)]
struct RegistratorArgs {
    /// Catalog node that owns every managed service entry
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Manage only functions tagged for this datacenter
    #[arg(long, env = "DATACENTER", default_value = "")]
    datacenter: String,

    /// Whether the mesh is an enterprise deployment
    #[arg(long, env = "ENTERPRISE", default_value_t = false)]
    enterprise: bool,

    /// Comma-separated admin partitions to manage (enterprise only)
    #[arg(long, env = "PARTITIONS", value_delimiter = ',', default_value = "")]
    partitions: Vec<String>,

    /// Parameter-store prefix for mTLS material; empty disables mTLS
    /// management
    #[arg(long, env = "CONSUL_EXTENSION_DATA_PREFIX", default_value = "")]
    extension_data_prefix: String,

    /// Page size for function inventory listing
    #[arg(long, env = "PAGE_SIZE", default_value_t = 50)]
    page_size: i32,

    /// Mesh HTTP API address
    #[arg(long, env = "CONSUL_HTTP_ADDR", default_value = "http://localhost:8500")]
    http_addr: String,

    /// Mesh HTTP API token
    #[arg(long, env = "CONSUL_HTTP_TOKEN")]
    http_token: Option<String>,

    /// Parameter-store key holding the mesh HTTP token; overrides the token
    /// argument when set
    #[arg(long, env = "CONSUL_HTTP_TOKEN_PATH", default_value = "")]
    http_token_path: String,

    /// Parameter-store key holding the mesh CA certificate
    #[arg(long, env = "CONSUL_CACERT_PATH", default_value = "")]
    ca_cert_path: String,

    /// Path to the triggering event JSON; a full sync runs when omitted
    #[arg(long)]
    event_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Extension(args) => run_extension(args).await,
        Commands::Registrator(args) => run_registrator(args).await,
    };

    if let Err(err) = result {
        error!(error = %err, "fatal error, exiting");
        std::process::exit(1);
    }
}

async fn run_extension(args: ExtensionArgs) -> Result<()> {
    let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let store = Arc::new(SsmStore::new(&sdk_config));

    let mut runtime = RuntimeClient::from_env()?;
    runtime.register(EXTENSION_NAME).await?;

    let config = ExtensionConfig {
        service_name: args.service_name,
        service_namespace: args.service_namespace,
        service_partition: args.service_partition,
        upstreams: args
            .upstreams
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect(),
        mesh_gateway_uri: args.mesh_gateway_uri,
        extension_data_prefix: args.extension_data_prefix,
        refresh_frequency: args.refresh_frequency,
        proxy_timeout: args.proxy_timeout,
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    Extension::new(config, store, Arc::new(runtime))
        .start(shutdown)
        .await
}

async fn run_registrator(args: RegistratorArgs) -> Result<()> {
    let raw = match &args.event_file {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => serde_json::json!({ "source": "aws.events" }),
    };

    let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let store = Arc::new(SsmStore::new(&sdk_config));

    let token = if args.http_token_path.is_empty() {
        args.http_token
    } else {
        Some(store.get(&args.http_token_path).await?)
    };
    let mut mesh = HttpMeshClient::new(args.http_addr, token);
    if !args.ca_cert_path.is_empty() {
        mesh = mesh.with_ca_cert(&store.get(&args.ca_cert_path).await?)?;
    }

    let config = RegistratorConfig {
        node_name: args.node_name,
        datacenter: args.datacenter,
        is_enterprise: args.enterprise,
        partitions: args
            .partitions
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<HashSet<_>>(),
        extension_data_prefix: args.extension_data_prefix,
    };

    let environment = Environment::new(
        config,
        Arc::new(mesh),
        Arc::new(LambdaApiClient::new(&sdk_config, args.page_size)),
        store,
    );
    environment.run(raw).await
}

/// Cancel the given token on SIGTERM or SIGINT.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => {
                    error!(error = %err, "failed to install terminate handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received interrupt, exiting"),
            _ = terminate => info!("received terminate signal, exiting"),
        }
        shutdown.cancel();
    });
}

/// Parse durations like `5m`, `30s`, or `250ms`.
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let offset = s
        .rfind(|c: char| c.is_ascii_digit())
        .ok_or_else(|| format!("{s:?} does not contain a duration value"))?;
    let (magnitude, unit) = s.split_at(offset + 1);
    let magnitude: u64 = magnitude
        .parse()
        .map_err(|_| format!("invalid duration value {magnitude:?}"))?;

    let millis = match unit {
        "ms" => magnitude,
        "s" => magnitude * 1000,
        "m" => magnitude * 1000 * 60,
        "h" => magnitude * 1000 * 60 * 60,
        _ => {
            return Err(format!(
                "invalid duration unit {unit:?} (expected 'ms', 's', 'm', or 'h')"
            ))
        }
    };
    Ok(Duration::from_millis(millis))
}
