use aras::{
    apps::{self, LoadedApp},
    limits::{ConnLimits, HttpLimits, Limits, ServerLimits},
    serve, ServeError,
};
use clap::{Args, Parser, Subcommand};
use std::net::{SocketAddr, ToSocketAddrs};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aras")]
#[command(version, about = "Asynchronous HTTP/1.1 and WebSocket server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve an application, given as `module:attribute`.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Application to serve (e.g. `testapp:app`).
    application: String,

    /// Bind socket to this host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind socket to this port.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Set the server log level (DEBUG|INFO|WARN|TRACE|OFF|ERROR).
    #[arg(long, default_value = "INFO")]
    log_level: String,

    /// Close every connection after a single request.
    #[arg(long)]
    no_keep_alive: bool,

    /// Cap on simultaneously executing handler tasks.
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Bound, in KiB, on a single request (head plus decoded body).
    #[arg(long, default_value_t = 1_000_000)]
    max_size_kb: usize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.cmd {
        Command::Serve(args) => run_serve(args).await,
    };
    std::process::exit(code);
}

async fn run_serve(args: ServeArgs) -> i32 {
    init_logging(&args.log_level);

    let Some(app) = apps::load(&args.application) else {
        eprintln!("failed to load application '{}'", args.application);
        return 1;
    };

    let addr = match resolve(&args.host, args.port) {
        Some(addr) => addr,
        None => {
            eprintln!("cannot resolve bind address {}:{}", args.host, args.port);
            return 2;
        }
    };

    let limits = Limits {
        server: ServerLimits {
            max_concurrency: args
                .max_concurrency
                .unwrap_or_else(|| ServerLimits::default().max_concurrency),
            ..ServerLimits::default()
        },
        conn: ConnLimits {
            keep_alive: !args.no_keep_alive,
            ..ConnLimits::default()
        },
        http: HttpLimits {
            max_size_kb: args.max_size_kb,
            ..HttpLimits::default()
        },
        ..Limits::default()
    };

    let result = match app {
        LoadedApp::Test(app) => serve(app, addr, limits).await,
        LoadedApp::FailingLifespan(app) => serve(app, addr, limits).await,
    };

    match result {
        Ok(()) => 0,
        Err(error @ ServeError::Bind(_)) => {
            eprintln!("{error}");
            2
        }
        Err(error @ ServeError::Lifespan(_)) => {
            eprintln!("{error}");
            3
        }
    }
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

fn init_logging(level: &str) {
    let directive = match level.to_ascii_uppercase().as_str() {
        "OFF" => "off",
        "ERROR" => "error",
        "WARN" => "warn",
        "DEBUG" => "debug",
        "TRACE" => "trace",
        _ => "info",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .init();
}
