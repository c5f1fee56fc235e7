//! # keelrpc CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run the shared directory
//! keelrpc directory -b 0.0.0.0:9990
//!
//! # Serve the echo service and publish it there
//! keelrpc serve -b 0.0.0.0:9998 --advertise 10.0.0.5:9998 -d 10.0.0.1:9990
//!
//! # Discover and call it (outputs raw JSON)
//! keelrpc call Echo echo -d 10.0.0.1:9990 --args '["hi"]'
//!
//! # Call a known endpoint directly: typed arguments, CBOR without compression
//! keelrpc call Echo concat -e 10.0.0.5:9998 -a '["a", "b"]' -t String -t String \
//!     --serializer cbor --compressor none
//! ```

use anyhow::Result;
use argh::FromArgs;
use std::time::Duration;

use keelrpc_cli::call::{call_service, parse_call_args, CallOptions, CallTarget};
use keelrpc_cli::directory::{directory_addr, run_directory};
use keelrpc_cli::serve::{run_serve, ServeOptions};
use keelrpc_common::{CompressionKind, Endpoint, SerializationKind, ServiceIdentity};
use keelrpc_registry::DEFAULT_DIRECTORY_ADDR;

#[derive(FromArgs)]
/// keelrpc - service-directory routed RPC
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Directory(DirectoryArgs),
    Serve(ServeArgs),
    Call(CallArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "directory")]
/// run the directory server that servers publish to and callers discover from
struct DirectoryArgs {
    /// address to bind the directory to
    #[argh(option, short = 'b', default = "DEFAULT_DIRECTORY_ADDR.into()")]
    bind: String,
}

/// Arguments for running a server.
///
/// # Example
///
/// ```bash
/// KEELRPC_ADVERTISE_ADDR=10.0.0.5:9998 keelrpc serve -b 0.0.0.0:9998
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run a keelrpc server with the echo service
struct ServeArgs {
    /// address to bind the server to
    #[argh(option, short = 'b', default = "\"0.0.0.0:9998\".into()")]
    bind: String,

    /// host:port to publish in the directory
    ///
    /// Overrides KEELRPC_ADVERTISE_ADDR. Defaults to the bound address.
    #[argh(option, long = "advertise")]
    advertise: Option<String>,

    /// identity of the echo service (Interface::group::version)
    #[argh(option, short = 's', long = "service", default = "\"Echo\".into()")]
    service: String,

    /// seconds without inbound traffic before a connection is closed
    #[argh(option, long = "idle-timeout", default = "60")]
    idle_timeout_secs: u64,

    /// maximum concurrent operations (defaults to twice the core count)
    #[argh(option, short = 'w', long = "workers")]
    workers: Option<usize>,

    /// directory server to publish to (defaults to KEELRPC_DIRECTORY_ADDR,
    /// otherwise the directory stays local to this process)
    #[argh(option, short = 'd', long = "directory")]
    directory: Option<String>,
}

/// Arguments for making a single call.
///
/// Outputs raw JSON (no pretty-printing) to stdout. Errors go to stderr
/// with a non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call an operation on a keelrpc service
struct CallArgs {
    /// service identity (Interface, Interface::group or Interface::group::version)
    #[argh(positional)]
    service: String,

    /// operation name
    #[argh(positional)]
    operation: String,

    /// host:port of a server to call directly, skipping discovery
    #[argh(option, short = 'e', long = "endpoint")]
    endpoint: Option<String>,

    /// directory server to discover providers from (defaults to
    /// KEELRPC_DIRECTORY_ADDR, then 127.0.0.1:9990)
    #[argh(option, short = 'd', long = "directory")]
    directory: Option<String>,

    /// JSON array of arguments
    #[argh(option, short = 'a', long = "args", default = "\"[]\".into()")]
    args: String,

    /// argument type, once per argument (defaults to String for each)
    #[argh(option, short = 't', long = "arg-type")]
    arg_types: Vec<String>,

    /// serializer: json or cbor
    #[argh(option, long = "serializer", default = "\"json\".into()")]
    serializer: String,

    /// compressor: none or deflate
    #[argh(option, long = "compressor", default = "\"deflate\".into()")]
    compressor: String,

    /// request timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "30000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call: keep stdout clean for piping to jq
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Directory(args) => run_directory(&args.bind).await,
        Commands::Serve(args) => run_serve(serve_options(args)?).await,
        Commands::Call(args) => {
            let result = call_service(call_options(args)?).await?;
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }
    }
}

fn serve_options(args: ServeArgs) -> Result<ServeOptions> {
    let advertise = args
        .advertise
        .as_deref()
        .map(|addr| {
            addr.parse::<Endpoint>()
                .map_err(|e| anyhow::anyhow!("Invalid advertise address {}: {}", addr, e))
        })
        .transpose()?;
    let service: ServiceIdentity = args
        .service
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid service identity {}: {}", args.service, e))?;

    Ok(ServeOptions {
        bind: args.bind,
        advertise,
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        workers: args.workers,
        service,
        directory: directory_addr(args.directory),
    })
}

fn call_target(endpoint: Option<String>, directory: Option<String>) -> Result<CallTarget> {
    match (endpoint, directory) {
        (Some(_), Some(_)) => Err(anyhow::anyhow!("Use either --endpoint or --directory, not both")),
        (Some(endpoint), None) => {
            let parsed: Endpoint = endpoint
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid endpoint {}: {}", endpoint, e))?;
            Ok(CallTarget::Endpoint(parsed))
        }
        (None, directory) => Ok(CallTarget::Directory(
            directory_addr(directory).unwrap_or_else(|| DEFAULT_DIRECTORY_ADDR.to_string()),
        )),
    }
}

fn call_options(args: CallArgs) -> Result<CallOptions> {
    let target = call_target(args.endpoint, args.directory)?;
    let service: ServiceIdentity = args
        .service
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid service identity {}: {}", args.service, e))?;
    let serializer: SerializationKind = args.serializer.parse()?;
    let compressor: CompressionKind = args.compressor.parse()?;
    let (arg_types, call_args) = parse_call_args(&args.args, args.arg_types)?;

    Ok(CallOptions {
        target,
        service,
        operation: args.operation,
        arg_types,
        args: call_args,
        serializer,
        compressor,
        timeout: Duration::from_millis(args.timeout_ms),
    })
}
