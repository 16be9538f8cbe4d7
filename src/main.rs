use anyhow::{Context, Result};
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use toe_r::tcp::{
    config::ToeConfig,
    defs::{AppNotification, SendError, SessionId, TcpError},
    usrreq::Toe,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(after_help = "EXAMPLES: ./toe_r -c 10.0.0.1 -s 10.0.0.2 -p 7 --message hello --drop-every 5")]
struct Args {
    #[arg(long, short = 'c', help = "Client engine address", default_value_t = Ipv4Addr::new(10, 0, 0, 1))]
    client: Ipv4Addr,

    #[arg(long, short = 's', help = "Server engine address", default_value_t = Ipv4Addr::new(10, 0, 0, 2))]
    server: Ipv4Addr,

    #[arg(long, short = 'p', help = "Server listening port, e.g., 7", default_value_t = 7)]
    port: u16,

    #[arg(long, short = 'm', help = "Payload sent by the client", default_value = "Hello from the offload engine!")]
    message: String,

    #[arg(long, help = "Repeat the payload this many times", default_value_t = 1)]
    repeat: usize,

    #[arg(long, help = "Maximum segment size", default_value_t = 1460)]
    mss: u16,

    #[arg(long, help = "Enable window scaling")]
    window_scale: bool,

    #[arg(long, help = "Use Nagle's algorithm instead of sending right away")]
    nagle: bool,

    #[arg(long, help = "Drop every n-th datagram on the wire, 0 never drops", default_value_t = 0)]
    drop_every: usize,

    #[arg(long, help = "Retransmission timer tick in milliseconds", default_value_t = 10)]
    tick: u64,

    #[arg(long, help = "Seconds to wait for each step", default_value_t = 10)]
    timeout: u64,
}

// Moves datagrams from one engine's egress to the other's ingress.
fn wire(
    name: &'static str,
    egress: Receiver<Vec<u8>>,
    ingress: Sender<Vec<u8>>,
    drop_every: usize,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            for (count, datagram) in egress.iter().enumerate() {
                if drop_every != 0 && (count + 1) % drop_every == 0 {
                    log::info!("[{}] Dropping datagram #{}.", name, count + 1);
                    continue;
                }
                if ingress.send(datagram).is_err() {
                    break;
                }
            }
            log::debug!("[{}] Wire is down.", name);
        })
        .with_context(|| format!("Failed to spawn {} wire.", name))
}

fn wait_notification(
    toe: &Toe,
    timeout: Duration,
    mut accept: impl FnMut(&AppNotification) -> bool,
) -> Result<AppNotification> {
    let deadline = Instant::now() + timeout;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match toe.next_notification(left)? {
            Some(notification) if accept(&notification) => return Ok(notification),
            Some(notification) => log::debug!("Skipping notification {:?}.", notification),
            None => break,
        }
    }
    anyhow::bail!(TcpError::Timeout {
        what: "notification"
    })
}

fn send_all(toe: &Toe, id: SessionId, data: &[u8], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let chunk = toe.config().mss as usize;
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + chunk).min(data.len());
        let response = toe.send(id, &data[offset..end])?;
        match response.error {
            SendError::None => offset += response.length as usize,
            SendError::NoSpace if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(1))
            }
            SendError::NoSpace => anyhow::bail!(TcpError::Timeout { what: "send space" }),
            SendError::NoConnection => anyhow::bail!(TcpError::InvalidSession { id }),
        }
    }
    Ok(())
}

fn receive_exact(toe: &Toe, id: SessionId, length: usize, timeout: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut data = Vec::with_capacity(length);
    while data.len() < length {
        let left = deadline
            .checked_duration_since(Instant::now())
            .ok_or(TcpError::Timeout { what: "payload" })?;
        wait_notification(toe, left, |n| n.session_id == id && n.length > 0)?;
        data.extend(toe.read(id, length - data.len())?);
    }
    Ok(data)
}

fn main() -> Result<()> {
    env_logger::builder().format_timestamp_millis().init();
    let args = Args::parse();
    let timeout = Duration::from_secs(args.timeout);
    let config = |local_addr: Ipv4Addr| ToeConfig {
        local_addr,
        mss: args.mss,
        window_scale: args.window_scale,
        tcp_nodelay: !args.nagle,
        timer_tick: Duration::from_millis(args.tick),
        retransmit_timeouts: [1, 5, 10, 15, 30].map(|ticks| Duration::from_millis(args.tick * ticks)),
        time_wait: Duration::from_millis(args.tick * 20),
        ..Default::default()
    };

    let (client_egress, client_wire) = channel();
    let (server_egress, server_wire) = channel();
    let client = Toe::new(config(args.client), client_egress)?;
    let server = Toe::new(config(args.server), server_egress)?;
    let wires = [
        wire("client->server", client_wire, server.ingress(), args.drop_every)?,
        wire("server->client", server_wire, client.ingress(), args.drop_every)?,
    ];

    if !server.listen(args.port)? {
        anyhow::bail!(TcpError::ListenDenied { port: args.port });
    }
    let remote = SocketAddrV4::new(args.server, args.port);
    let client_id = client.open(remote)?;
    let status = client
        .next_open_status(timeout)?
        .ok_or(TcpError::Timeout {
            what: "open status",
        })?;
    if !status.success {
        anyhow::bail!(TcpError::OpenFailed { addr: remote });
    }
    let accepted = wait_notification(&server, timeout, |n| n.opened)?;
    let server_id = accepted.session_id;
    println!("Connected: client session {} <-> server session {} ({})", client_id, server_id, accepted.remote_addr);

    let payload = args.message.repeat(args.repeat).into_bytes();
    send_all(&client, client_id, &payload, timeout)?;
    let received = receive_exact(&server, server_id, payload.len(), timeout)?;
    send_all(&server, server_id, &received, timeout)?;
    let echoed = receive_exact(&client, client_id, payload.len(), timeout)?;
    println!("Echoed {} bytes: {}", echoed.len(), String::from_utf8_lossy(&echoed));
    anyhow::ensure!(echoed == payload, "Echoed payload differs from what was sent.");

    client.close(client_id)?;
    wait_notification(&server, timeout, |n| n.session_id == server_id && n.closed)?;
    println!("Server session {} closed.", server_id);

    println!("--- client {} ---\n{}", args.client, client.stats());
    println!("--- server {} ---\n{}", args.server, server.stats());

    client.shutdown()?;
    server.shutdown()?;
    drop(client);
    drop(server);
    for wire in wires {
        wire.join()
            .map_err(|_| anyhow::anyhow!("Wire thread panicked."))?;
    }
    Ok(())
}
