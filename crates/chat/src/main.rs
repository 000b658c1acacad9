use clap::Parser;
use color_eyre::eyre;
use libp2p_identity::Keypair;
use nymlink_transport::{Connection, NymAddr, NymTransport, Substream, TransportConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Echo peer over the Nym mixnet.
///
/// Connects to a local mixnet client, prints its own `/nym/...` address and
/// echoes every inbound stream. With `--dial` it additionally sends one
/// message to a remote peer and prints the reply.
#[derive(Debug, Parser)]
#[clap(author, about, version)]
struct Args {
    /// Websocket URL of the local mixnet client, e.g. ws://127.0.0.1:1977
    gateway: String,

    /// Peer address to dial, e.g. /nym/<ident>.<enc>@<gateway>
    #[clap(long)]
    dial: Option<NymAddr>,

    /// Message sent on the dialed stream
    #[clap(long, default_value = "hello over nym")]
    message: String,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    setup()?;

    let args = Args::parse();

    let keypair = Keypair::generate_ed25519();
    let transport = NymTransport::new(&args.gateway, &keypair, TransportConfig::default()).await?;

    info!(peer = %transport.local_peer_id(), "transport ready");
    println!("listening on {}", transport.listen_addr());

    let mut listener = transport.listen(transport.listen_addr())?;
    drop(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(connection) => {
                    info!(peer = %connection.remote_peer_id(), "inbound connection");
                    drop(tokio::spawn(serve_connection(connection)));
                }
                Err(err) => {
                    info!(%err, "listener finished");
                    break;
                }
            }
        }
    }));

    if let Some(addr) = &args.dial {
        let connection = transport.dial(addr, None).await?;
        info!(peer = %connection.remote_peer_id(), "dialed peer");

        let mut stream = connection.open_stream().await?;
        stream.write_all(args.message.as_bytes()).await?;

        let mut buf = vec![0; 4096];
        let n = stream.read(&mut buf).await?;
        println!("peer replied: {}", String::from_utf8_lossy(&buf[..n]));

        stream.shutdown().await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    transport.close();

    Ok(())
}

async fn serve_connection(connection: Connection) {
    loop {
        match connection.accept_stream().await {
            Ok(stream) => drop(tokio::spawn(echo(stream))),
            Err(_) => break,
        }
    }
}

async fn echo(mut stream: Substream) {
    let mut buf = vec![0; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if let Err(err) = stream.write_all(&buf[..n]).await {
            error!(%err, "echo write failed");
            break;
        }
    }
    let _closed = stream.shutdown().await;
}

fn setup() -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::builder().parse(format!(
            "info,{}",
            std::env::var("RUST_LOG").unwrap_or_default()
        ))?)
        .with(tracing_subscriber::fmt::layer())
        .init();

    color_eyre::install()?;

    Ok(())
}
