//! SigRPC command line
//!
//! Serves the demo methods or calls them on a running server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use protocol::{Authenticator, CodecKind, Kwargs, Value};
use rpc::config::{load_identity, load_or_create_identity, save_identity, Config};
use rpc::dispatcher::{Dispatcher, HandlerError, ParamSpec, Params};
use rpc::transport::{
    Channel, ChannelOptions, HttpClientCarrier, HttpServerCarrier, StreamCarrier, StreamListener,
};
use rpc::{RpcClient, RpcServer};

/// SigRPC - signature-authenticated RPC over TCP, Unix sockets and HTTP.
#[derive(Parser, Debug)]
#[command(name = "sigrpc")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve the demo methods
    Serve {
        /// Stream endpoint (`host:port` or `unix:/path`)
        #[arg(long)]
        listen: Option<String>,

        /// Also accept HTTP POSTs on this address
        #[arg(long)]
        http: Option<String>,

        /// Wire codec (json or msgpack)
        #[arg(long)]
        codec: Option<CodecKind>,
    },

    /// Call a method and print its result
    Call {
        /// Method name
        method: String,

        /// Positional arguments as JSON (bare words are sent as strings)
        args: Vec<String>,

        /// Named argument as key=JSON, may be repeated
        #[arg(long = "kwarg", short = 'k', value_name = "KEY=VALUE")]
        kwargs: Vec<String>,

        /// Server endpoint (`host:port`, `unix:/path` or `http://...`)
        #[arg(long, short)]
        endpoint: Option<String>,

        /// Wire codec (json or msgpack)
        #[arg(long)]
        codec: Option<CodecKind>,

        /// Timeout in seconds
        #[arg(long, short)]
        timeout: Option<u64>,
    },

    /// Send a notification
    Notify {
        /// Method name
        method: String,

        /// Positional arguments as JSON (bare words are sent as strings)
        args: Vec<String>,

        /// Server endpoint (`host:port`, `unix:/path` or `http://...`)
        #[arg(long, short)]
        endpoint: Option<String>,

        /// Wire codec (json or msgpack)
        #[arg(long)]
        codec: Option<CodecKind>,
    },

    /// Generate a new identity key
    Keygen {
        /// Where to write the key (defaults to the configured identity file)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Overwrite an existing key
        #[arg(long, short)]
        force: bool,
    },

    /// Print the public key and fingerprint of the local identity
    Identity,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            listen,
            http,
            codec,
        } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if http.is_some() {
                config.server.http_listen = http;
            }
            if let Some(codec) = codec {
                config.server.codec = codec;
            }
            run_server(config).await?;
        }
        Commands::Call {
            method,
            args,
            kwargs,
            endpoint,
            codec,
            timeout,
        } => {
            apply_client_flags(&mut config, endpoint, codec, timeout);
            let args: Vec<Value> = args.iter().map(|a| parse_arg(a)).collect();
            let kwargs = kwargs
                .iter()
                .map(|kv| parse_kwarg(kv))
                .collect::<anyhow::Result<Kwargs>>()?;

            if !args.is_empty() && !kwargs.is_empty() {
                anyhow::bail!("Positional and named arguments cannot be mixed");
            }

            let client = connect(&config).await?;
            let result = if kwargs.is_empty() {
                client.call(&method, args).await
            } else {
                client.call_kwargs(&method, kwargs).await
            };
            let _ = client.close().await;

            match result {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(e) => {
                    eprintln!("Error {}: {}", e.code(), e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Notify {
            method,
            args,
            endpoint,
            codec,
        } => {
            apply_client_flags(&mut config, endpoint, codec, None);
            let args = args.iter().map(|a| parse_arg(a)).collect();

            let client = connect(&config).await?;
            client
                .notify(&method, args)
                .await
                .with_context(|| format!("Failed to notify {}", method))?;
            client.close().await?;
        }
        Commands::Keygen { output, force } => {
            let path = output.unwrap_or_else(|| config.security.identity_file.clone());
            if path.exists() && !force {
                anyhow::bail!(
                    "Identity already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }

            let identity = protocol::Identity::generate();
            save_identity(&path, &identity)?;
            println!("Wrote {}", path.display());
            println!("Public key:  {}", identity.to_peer_identity().public_key_hex());
            println!("Fingerprint: {}", identity.fingerprint());
        }
        Commands::Identity => {
            let identity = load_identity(&config.security.identity_file)?;
            println!("Public key:  {}", identity.to_peer_identity().public_key_hex());
            println!("Fingerprint: {}", identity.fingerprint());
        }
    }

    Ok(())
}

fn apply_client_flags(
    config: &mut Config,
    endpoint: Option<String>,
    codec: Option<CodecKind>,
    timeout: Option<u64>,
) {
    if let Some(endpoint) = endpoint {
        config.client.endpoint = endpoint;
    }
    if let Some(codec) = codec {
        config.server.codec = codec;
    }
    if let Some(timeout) = timeout {
        config.client.timeout_secs = timeout;
    }
}

/// Parse a command line argument as JSON, falling back to a plain string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Parse `key=value` where the value follows [`parse_arg`].
fn parse_kwarg(raw: &str) -> anyhow::Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Named argument must be KEY=VALUE, got {}", raw))?;
    if key.is_empty() {
        anyhow::bail!("Named argument has an empty key: {}", raw);
    }
    Ok((key.to_string(), parse_arg(value)))
}

/// Open an authenticated client for the configured endpoint.
async fn connect(config: &Config) -> anyhow::Result<RpcClient> {
    let identity = load_or_create_identity(&config.security.identity_file)?;
    let authenticator = Arc::new(config.authenticator(identity)?);
    let endpoint = &config.client.endpoint;

    let channel = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Channel::open(
            HttpClientCarrier::new(endpoint.clone()),
            authenticator,
            ChannelOptions::default(),
        )
        .await?
    } else {
        let carrier = StreamCarrier::connect(endpoint)
            .await
            .with_context(|| format!("Failed to connect to {}", endpoint))?;
        Channel::open(carrier, authenticator, ChannelOptions::default())
            .await
            .with_context(|| format!("Handshake with {} failed", endpoint))?
    };

    if let Some(peer) = channel.peer() {
        tracing::debug!(peer = %peer.fingerprint(), "connected");
    }

    Ok(RpcClient::new(
        channel,
        config.server.codec.build(),
        config.client_config(),
    ))
}

/// Serve the demo methods until Ctrl-C.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let identity = load_or_create_identity(&config.security.identity_file)?;
    let policy = config.trust_policy_factory()?;
    tracing::info!(
        fingerprint = %identity.fingerprint(),
        trust = ?config.security.trust_policy,
        codec = config.server.codec.build().name(),
        "sigrpc server starting"
    );

    let server = RpcServer::new(
        demo_dispatcher()?,
        config.server.codec.build(),
        config.server_config(),
    );

    let listener = StreamListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    let stream_task = {
        let server = server.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            server
                .serve_listener(listener, move || {
                    Arc::new(Authenticator::new(identity.clone(), policy()))
                })
                .await
        })
    };

    let http_task = match &config.server.http_listen {
        Some(addr) => {
            let carrier = HttpServerCarrier::bind(addr, config.server.max_body_size)
                .await
                .with_context(|| format!("Failed to bind HTTP on {}", addr))?;
            let authenticator = Arc::new(config.authenticator(identity)?);
            let server = server.clone();
            Some(tokio::spawn(async move {
                server.serve_http(carrier, authenticator).await
            }))
        }
        None => None,
    };

    wait_for_shutdown_signal().await;
    server.shutdown();

    let drain = async {
        let _ = stream_task.await;
        if let Some(task) = http_task {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        tracing::warn!("Shutdown timed out with connections still open");
    }

    tracing::info!("sigrpc server stopped");
    Ok(())
}

/// Wait for Ctrl-C.
async fn wait_for_shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }
}

/// The methods served by `sigrpc serve`.
fn demo_dispatcher() -> anyhow::Result<Dispatcher> {
    let mut dispatcher = Dispatcher::new();

    dispatcher.register(
        "reverse_string",
        ParamSpec::new().required("value"),
        |p: Params| async move {
            let value: String = p.get(0, "value")?;
            Ok::<_, HandlerError>(Value::String(value.chars().rev().collect()))
        },
    )?;

    dispatcher.register(
        "add",
        ParamSpec::new().required("a").required("b"),
        |p: Params| async move {
            let a: Value = p.get(0, "a")?;
            let b: Value = p.get(1, "b")?;
            match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a
                    .checked_add(b)
                    .map(Value::from)
                    .ok_or_else(|| HandlerError::application("integer overflow")),
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => Ok(Value::from(a + b)),
                    _ => Err(HandlerError::InvalidParams(
                        "add expects two numbers".to_string(),
                    )),
                },
            }
        },
    )?;

    dispatcher.register("echo", ParamSpec::any(), |p: Params| async move {
        Ok::<_, HandlerError>(serde_json::json!({
            "args": p.args(),
            "kwargs": p.kwargs(),
        }))
    })?;

    dispatcher.register(
        "sleep",
        ParamSpec::new().required("seconds"),
        |p: Params| async move {
            let seconds: f64 = p.get(0, "seconds")?;
            if !(0.0..=60.0).contains(&seconds) {
                return Err(HandlerError::InvalidParams(
                    "seconds must be between 0 and 60".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            Ok(Value::from(seconds))
        },
    )?;

    dispatcher.register_notification(
        "log",
        ParamSpec::new().required("message"),
        |p: Params| async move {
            let message: String = p.get(0, "message")?;
            tracing::info!(message = %message, "log notification");
            Ok::<_, HandlerError>(())
        },
    )?;

    dispatcher.set_notification_hook(Arc::new(|failure| {
        tracing::warn!(
            method = %failure.method,
            code = failure.code.code(),
            error = %failure.message,
            "notification failed"
        );
    }));

    Ok(dispatcher)
}
