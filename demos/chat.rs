//! A line-based chat over the transport, with UDP as the link.
//!
//! Start a server with link address 1, then clients that know where it is:
//!
//! ```text
//! cargo run --example chat -- server 1 127.0.0.1:5001
//! cargo run --example chat -- client 2 127.0.0.1:5002 --server 1 --server-udp 127.0.0.1:5001
//! ```
//!
//! Every line a client types is sent to all other clients. A line consisting of `.` ends the
//!  client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::BytesMut;
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use ntp_transport::config::NtpConfig;
use ntp_transport::connection::Connection;
use ntp_transport::dispatcher::Dispatcher;
use ntp_transport::link::udp::UdpLink;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::time::{interval, timeout};
use tracing::{info, warn, Level};

const CHAT_PORT: u8 = 15;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// accept clients on the chat port and relay their lines to each other
    Server {
        link_address: u8,
        bind: SocketAddr,
    },
    /// connect to a server's chat port
    Client {
        link_address: u8,
        bind: SocketAddr,
        #[arg(long)]
        server: u8,
        #[arg(long)]
        server_udp: SocketAddr,
    },
}

/// bytes received on a connection, split into lines
struct LineReader {
    buf: BytesMut,
}

impl LineReader {
    fn new() -> LineReader {
        LineReader { buf: BytesMut::new() }
    }

    /// Returns the complete lines available now, or `None` once the stream ended
    async fn poll_lines(&mut self, connection: &Connection) -> Option<Vec<String>> {
        loop {
            match connection.read(1000).await {
                None => return None,
                Some(data) if data.is_empty() => break,
                Some(data) => self.buf.extend_from_slice(&data),
            }
        }

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        Some(lines)
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    match args.mode {
        Mode::Server { link_address, bind } => {
            let link = Arc::new(UdpLink::bind(link_address, bind, FxHashMap::default()).await?);
            let dispatcher = Dispatcher::new(NtpConfig::default(), link).await?;
            run_server(&dispatcher).await
        }
        Mode::Client { link_address, bind, server, server_udp } => {
            let mut address_book = FxHashMap::default();
            address_book.insert(server, server_udp);
            let link = Arc::new(UdpLink::bind(link_address, bind, address_book).await?);
            let dispatcher = Dispatcher::new(NtpConfig::default(), link).await?;
            run_client(&dispatcher, server).await
        }
    }
}

async fn run_server(dispatcher: &Dispatcher) -> anyhow::Result<()> {
    info!("chat server listening on port {}", CHAT_PORT);

    let mut clients: Vec<(Arc<Connection>, LineReader)> = Vec::new();
    let mut ticks = interval(POLL_INTERVAL);

    loop {
        select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticks.tick() => {}
        }

        while let Some(connection) = dispatcher.accept(CHAT_PORT).await {
            info!("client {} connected", connection.key());
            clients.push((connection, LineReader::new()));
        }

        let mut broadcasts = Vec::new();
        let mut disconnected = Vec::new();
        for (i, (connection, reader)) in clients.iter_mut().enumerate() {
            match reader.poll_lines(connection).await {
                Some(lines) => broadcasts.extend(lines.into_iter().map(|line| (i, line))),
                None => disconnected.push(i),
            }
        }

        for (from, line) in broadcasts {
            print!("broadcast: {}", line);
            for (i, (connection, _)) in clients.iter().enumerate() {
                if i != from && connection.write(line.as_bytes()).await.is_err() {
                    warn!("unable to write to client {}", connection.key());
                }
            }
        }

        for i in disconnected.into_iter().rev() {
            let (connection, _) = clients.remove(i);
            info!("client {} disconnected", connection.key());
            connection.close().await;
        }
    }

    info!("shutting down");
    dispatcher.shutdown().await;
    Ok(())
}

async fn run_client(dispatcher: &Dispatcher, server: u8) -> anyhow::Result<()> {
    let connection = dispatcher.connect(server, CHAT_PORT).await?;
    println!("Successfully connected to host {}", server);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut reader = LineReader::new();
    let mut ticks = interval(POLL_INTERVAL);

    loop {
        select! {
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line == "." {
                    println!("Received exit command. Bye!");
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                if connection.write(format!("{}\n", line).as_bytes()).await.is_err() {
                    println!("Server not responding. Bye!");
                    break;
                }
            }
            _ = ticks.tick() => {
                match reader.poll_lines(&connection).await {
                    Some(lines) => lines.iter().for_each(|line| print!("{}", line)),
                    None => {
                        println!("Server shutdown. Bye!");
                        break;
                    }
                }
            }
        }
    }

    connection.close().await;
    if timeout(Duration::from_secs(5), dispatcher.shutdown()).await.is_err() {
        warn!("server did not complete the close handshake");
    }
    Ok(())
}
