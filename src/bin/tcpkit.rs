use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use dotenv::dotenv;
use tcpkit::network::Frame;
use tcpkit::{
    setup_local_tracing, setup_tracing, AppResult, CodecKind, CodecParams, Connection,
    Listener, ReconnectingClient, ShutdownTrigger, TcpkitConfig,
};
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for the rolling log file, console only when absent
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// Echo every frame back to its sender
    Serve {
        /// overrides network.ip and network.port
        #[arg(short, long)]
        address: Option<String>,
    },
    /// Dial a server and log the frames it sends
    Connect {
        /// overrides client.address
        #[arg(short, long)]
        address: Option<String>,
        /// sent once the first connect succeeds
        #[arg(short, long)]
        message: Option<String>,
    },
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }
    let _log_guard = match &commandline.log_dir {
        Some(dir) => Some(setup_tracing(dir)?),
        None => {
            setup_local_tracing()?;
            None
        }
    };

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = TcpkitConfig::set_up_config(config_path)?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    match commandline.command {
        Some(Command::PrintConfig) => {
            println!("{:#?}", config);
            Ok(())
        }
        Some(Command::Connect { address, message }) => rt.block_on(connect(config, address, message)),
        Some(Command::Serve { address }) => rt.block_on(serve(config, address)),
        None => rt.block_on(serve(config, None)),
    }
}

async fn serve(config: TcpkitConfig, address: Option<String>) -> AppResult<()> {
    let address = address.unwrap_or_else(|| config.network.listen_address());
    let listener = Listener::bind_with(&address, config.codec()?, &config.network).await?;
    info!("serving on {}", listener.local_addr()?);

    let trigger = ShutdownTrigger::new();
    let shutdown = trigger.subscribe();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", err);
        }
        info!("ctrl-c received, stop accepting");
        trigger.trigger();
    });

    let codec_kind = config.network.codec;
    listener
        .run_until(move |connection| echo(connection, codec_kind), shutdown)
        .await
}

fn echo(connection: &Connection, codec_kind: CodecKind) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    connection.on_data(move |frame| {
        let _ = tx.send(frame);
    });
    let peer = connection.peer_addr();
    connection.on_close(move || info!("{} went away", peer));
    connection.on_error(move |err| warn!("{} failed: {}", peer, err));

    let connection = connection.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = connection.closed() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(err) = echo_frame(&connection, codec_kind, frame).await {
                warn!("echo to {} failed: {}", peer, err);
                connection.close();
                break;
            }
        }
    });
}

async fn echo_frame(connection: &Connection, codec_kind: CodecKind, frame: Bytes) -> AppResult<()> {
    match codec_kind {
        CodecKind::LengthPrefixed => {
            let frame = Frame::decode(&frame)?;
            let params = CodecParams::with_message_type(frame.header.message_type)
                .target_id(frame.header.target_id);
            connection.send(&frame.payload, &params).await?;
        }
        CodecKind::Delimited => {
            connection.send(&frame, &CodecParams::default()).await?;
        }
    }
    Ok(())
}

async fn connect(
    config: TcpkitConfig,
    address: Option<String>,
    message: Option<String>,
) -> AppResult<()> {
    let address = address.unwrap_or_else(|| config.client.address.clone());
    let client = ReconnectingClient::from_config(config.codec()?, &config.client)?;

    let result = client
        .connect(&address, |connection| {
            let peer = connection.peer_addr();
            connection.on_data(move |frame| println!("{} > {:?}", peer, frame));
            connection.on_close(move || info!("{} closed the connection", peer));
            connection.on_error(move |err| warn!("connection to {} failed: {}", peer, err));
        })
        .await;
    match result {
        Ok(_) => {}
        // the supervisor keeps redialing when heartbeat is on
        Err(err) if client.is_supervised() => warn!("initial connect failed: {}", err),
        Err(err) => return Err(err),
    }

    if let Some(message) = message {
        if let Err(err) = client.send(message.as_bytes(), &CodecParams::default()).await {
            warn!("failed to send {:?}: {}", message, err);
        }
    }

    let wait_for_close = async {
        loop {
            match client.connection() {
                Some(connection) if !client.is_supervised() => {
                    connection.closed().await;
                    break;
                }
                _ if !client.is_supervised() => break,
                _ => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
        _ = wait_for_close => info!("connection closed"),
    }
    client.close();
    Ok(())
}
