use std::io::Write;
use std::os::fd::FromRawFd;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};

use sfu_worker::channel::{Channel, Notification};
use sfu_worker::worker::{parse_log_level, Worker};

const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 42;
const EXIT_SIGNAL_BASE: i32 = 128;
const SIGINT_NUM: i32 = 2;
const SIGTERM_NUM: i32 = 15;

#[derive(Parser)]
#[command(name = "sfu-worker")]
#[command(version = "0.1.0")]
#[command(about = "SFU worker: receive-side RTP dispatch and congestion estimation")]
struct Cli {
    /// Worker id, reported in dumps and notifications.
    #[arg(long)]
    id: String,
    /// Inherited file descriptor carrying the control channel.
    #[arg(long, conflicts_with = "socket")]
    channel_fd: Option<i32>,
    /// Unix socket path to connect the control channel to.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Log level: debug, warn or error. Overrides MEDIASOUP_LOG_LEVEL.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logger(&cli);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("worker failed: {err:#}");
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

fn init_logger(cli: &Cli) {
    let level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("MEDIASOUP_LOG_LEVEL").ok())
        .and_then(|level| parse_log_level(&level).ok())
        .unwrap_or(log::LevelFilter::Warn);

    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                chrono::Local::now().format("%H:%M:%S%.6f"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .init();
}

async fn open_channel(cli: &Cli) -> Result<UnixStream> {
    if let Some(fd) = cli.channel_fd {
        // Safety: the parent hands this descriptor over on the command line
        // and nothing else owns it.
        let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
        std_stream
            .set_nonblocking(true)
            .context("setting channel fd non-blocking")?;
        return UnixStream::from_std(std_stream).context("adopting channel fd");
    }
    if let Some(path) = &cli.socket {
        return UnixStream::connect(path)
            .await
            .with_context(|| format!("connecting to {}", path.display()));
    }
    bail!("either --channel-fd or --socket is required");
}

async fn run(cli: Cli) -> Result<i32> {
    let stream = open_channel(&cli).await?;
    let mut channel = Channel::new(stream);
    let mut worker = Worker::new(cli.id.clone());

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    // A dying parent must not take the worker down with a broken pipe.
    let mut sigpipe = signal(SignalKind::pipe())?;

    info!("worker running [workerId:{}]", worker.id);

    let exit_code = loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT received");
                break EXIT_SIGNAL_BASE + SIGINT_NUM;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break EXIT_SIGNAL_BASE + SIGTERM_NUM;
            }
            _ = sigpipe.recv() => {
                debug!("SIGPIPE ignored");
            }
            request = channel.recv() => match request {
                Ok(Some(request)) => {
                    let response = match worker.handle_request(&request) {
                        Ok(data) => request.accept(data),
                        Err(err) => {
                            warn!("request failed [method:{}]: {err}", request.method);
                            request.reject(err.to_string())
                        }
                    };
                    if channel.send_response(&response).await.is_err() {
                        info!("channel closed while responding");
                        break EXIT_SUCCESS;
                    }
                    // Notifications are flushed between handler invocations.
                    for notification in worker.take_notifications() {
                        if channel.send_notification(&notification).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    info!("channel remotely closed");
                    break EXIT_SUCCESS;
                }
                Err(err) => {
                    error!("channel error: {err}");
                    break EXIT_ERROR;
                }
            }
        }
    };

    // Orderly close: rooms are torn down first, then the parent is told if
    // the channel is still writable.
    worker.close();
    let close_notification = Notification::new("worker.close", json!({ "workerId": worker.id }));
    let _ = channel.send_notification(&close_notification).await;

    Ok(exit_code)
}
