use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use metalock::meta::{Config, LockManager, create_meta_store};
use metalock::{FileLockQuery, FileLockRange, FileLockType};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "metalock", version, about = "Distributed POSIX locks on a shared metadata store", long_about = None)]
struct Cli {
    /// Metadata store URL (sqlite:..., postgres://..., memory://)
    #[arg(long, env = "METALOCK_META_URL", default_value = "sqlite://metalock.db?mode=rwc")]
    meta_url: String,

    /// YAML config file; takes precedence over --meta-url
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session id of this client
    #[arg(long, env = "METALOCK_SID", default_value_t = 1)]
    sid: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Create the lock tables")]
    Init,
    #[command(about = "Register an inode so it can be locked")]
    Mknode { inode: i64 },
    #[command(about = "Forget an inode")]
    Rmnode { inode: i64 },
    #[command(about = "Take or release a whole-file lock")]
    Flock {
        inode: i64,
        #[arg(long, default_value_t = 0)]
        owner: u64,
        #[arg(long = "type", value_enum)]
        lock_type: LockKind,
        /// Wait for conflicting locks instead of failing
        #[arg(long)]
        wait: bool,
    },
    #[command(about = "Show the first lock that would block a request")]
    Getlk {
        inode: i64,
        #[arg(long, default_value_t = 0)]
        owner: u64,
        #[arg(long = "type", value_enum)]
        lock_type: LockKind,
        #[arg(long, default_value_t = 0)]
        start: u64,
        #[arg(long, default_value_t = u64::MAX)]
        end: u64,
    },
    #[command(about = "Take or release a byte-range lock")]
    Setlk {
        inode: i64,
        #[arg(long, default_value_t = 0)]
        owner: u64,
        #[arg(long = "type", value_enum)]
        lock_type: LockKind,
        #[arg(long, default_value_t = 0)]
        start: u64,
        #[arg(long, default_value_t = u64::MAX)]
        end: u64,
        #[arg(long, default_value_t = std::process::id())]
        pid: u32,
        /// Wait for conflicting locks instead of failing
        #[arg(long)]
        wait: bool,
    },
    #[command(about = "List every lock held on an inode")]
    Locks { inode: i64 },
    #[command(about = "Drop every lock held by a session")]
    CleanSession { sid: u64 },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LockKind {
    Read,
    Write,
    Unlock,
}

impl From<LockKind> for FileLockType {
    fn from(kind: LockKind) -> Self {
        match kind {
            LockKind::Read => FileLockType::Read,
            LockKind::Write => FileLockType::Write,
            LockKind::Unlock => FileLockType::UnLock,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::from_url(&cli.meta_url)?,
    };
    let store = create_meta_store(&config).await?;
    let manager = LockManager::new(store.clone(), cli.sid, config.lock.clone());

    let ctx = CancellationToken::new();
    tokio::spawn({
        let ctx = ctx.clone();
        async move {
            shutdown_signal().await;
            ctx.cancel();
        }
    });

    match cli.command {
        Commands::Init => info!("Meta store ready: {}", config.database.db_type_str()),
        Commands::Mknode { inode } => store.create_node(inode).await?,
        Commands::Rmnode { inode } => store.remove_node(inode).await?,
        Commands::Flock {
            inode,
            owner,
            lock_type,
            wait,
        } => {
            manager
                .flock(&ctx, inode, owner, lock_type.into(), wait)
                .await?;
            println!("ok");
        }
        Commands::Getlk {
            inode,
            owner,
            lock_type,
            start,
            end,
        } => {
            let query = FileLockQuery {
                owner,
                lock_type: lock_type.into(),
                range: FileLockRange::new(start, end),
            };
            let info = manager.getlk(inode, &query).await?;
            match info.lock_type {
                FileLockType::UnLock => println!("unlocked"),
                t => println!(
                    "{t:?} {}-{} pid={}",
                    info.range.start, info.range.end, info.pid
                ),
            }
        }
        Commands::Setlk {
            inode,
            owner,
            lock_type,
            start,
            end,
            pid,
            wait,
        } => {
            manager
                .setlk(
                    &ctx,
                    inode,
                    owner,
                    wait,
                    lock_type.into(),
                    FileLockRange::new(start, end),
                    pid,
                )
                .await?;
            println!("ok");
        }
        Commands::Locks { inode } => {
            let (flocks, plocks) = manager.list_locks(inode).await?;
            for f in flocks {
                println!("flock {} {}", f.holder, f.lock_type.as_str());
            }
            for p in plocks {
                for r in p.records {
                    println!(
                        "plock {} {:?} {}-{} pid={}",
                        p.holder, r.lock_type, r.start, r.end, r.pid
                    );
                }
            }
        }
        Commands::CleanSession { sid } => {
            let removed = store.clean_session_locks(sid).await?;
            info!("Removed {removed} lock rows of session {sid}");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Interrupted, cancelling pending lock requests");
}
