use anyhow::{bail, Context, Result};
use clap::Parser;

use bsync_tools_bsync::actions::{ActionServer, ServerConfig};
use bsync_tools_bsync::httpd;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bsyncd",
    version,
    about = "Blind backup server daemon - stores what clients send without ever seeing plaintext",
    long_about = "`bsyncd` serves the bsync action protocol over HTTP: listing, stat, uploads, \
downloads, change batches and long-poll change notification, all confined per user to a prefix \
of the backup root. Users live in a line-oriented passwd file \
(login:prefix:perms:password, permission codes WDRSTAN) that can be edited while the server \
runs.

TLS termination is left to the reverse proxy in front of the daemon.

EXAMPLE:
    bsyncd --backup-root /srv/backups --passwd-file /etc/bsyncd.passwd -p 8888"
)]
struct Args {
    /// Port to listen on
    #[arg(short = 'p', long, default_value = "8888", value_name = "PORT")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", value_name = "ADDR")]
    bind: String,

    /// Directory all user trees live under
    #[arg(long = "backup-root", value_name = "DIR")]
    backup_root: std::path::PathBuf,

    /// User store file (login:prefix:perms:password per line)
    #[arg(long = "passwd-file", value_name = "FILE")]
    passwd_file: std::path::PathBuf,

    /// Directory for staging uploads (defaults to the system temp dir)
    #[arg(long, value_name = "DIR")]
    tmpdir: Option<std::path::PathBuf>,

    /// Long-poll TTL for change observers, in seconds
    #[arg(long = "poll-ttl", default_value = "1.0", value_name = "SECONDS")]
    poll_ttl: f64,

    /// Long-poll re-check granularity, in seconds
    #[arg(long = "poll-granularity", default_value = "0.1", value_name = "SECONDS")]
    poll_granularity: f64,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if !args.backup_root.is_dir() {
        bail!("backup root directory {:?} does not exist", args.backup_root);
    }
    if !args.passwd_file.is_file() {
        bail!("passwd file {:?} does not exist", args.passwd_file);
    }
    if args.poll_ttl <= 0.0 || args.poll_granularity <= 0.0 || args.poll_granularity >= args.poll_ttl
    {
        bail!("poll granularity must be positive and below the poll TTL");
    }

    let server = std::sync::Arc::new(ActionServer::new(ServerConfig {
        backup_root: args.backup_root.clone(),
        passwd_file: args.passwd_file.clone(),
        tmp_dir: args.tmpdir.clone(),
        poll_ttl: std::time::Duration::from_secs_f64(args.poll_ttl),
        poll_granularity: std::time::Duration::from_secs_f64(args.poll_granularity),
    }));
    let listener = tokio::net::TcpListener::bind((args.bind.as_str(), args.port))
        .await
        .with_context(|| format!("cannot listen on {}:{}", args.bind, args.port))?;

    let shutdown = tokio_util::sync::CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, shutting down");
                shutdown.cancel();
            }
        });
    }
    httpd::serve(server, listener, shutdown).await
}
