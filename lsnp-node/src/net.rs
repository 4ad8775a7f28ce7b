//! UDP transport and the daemon's long-lived tasks: receive loop, tick loop,
//! keep-alive, and paced chunk streams. All of them share one `LsnpCore`.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use lsnp_core::protocol::MAX_DATAGRAM_LEN;
use lsnp_core::{CoreEvent, Destination, LsnpCore, OutboundAction};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub type SharedCore = Arc<Mutex<LsnpCore>>;

/// The protocol socket: bound once on all interfaces, broadcast enabled.
pub struct Transport {
    socket: UdpSocket,
    broadcast: SocketAddr,
}

impl Transport {
    pub fn bind(port: u16, broadcast: Ipv4Addr) -> io::Result<Self> {
        let std_sock = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        std_sock.set_broadcast(true)?;
        std_sock.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_sock)?;
        let port = socket.local_addr()?.port();
        Ok(Self {
            socket,
            broadcast: SocketAddr::V4(SocketAddrV4::new(broadcast, port)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send(&self, to: Destination, bytes: &[u8]) -> io::Result<()> {
        let addr = match to {
            Destination::Unicast(addr) => addr,
            Destination::Broadcast => self.broadcast,
        };
        self.socket.send_to(bytes, addr).await.map(|_| ())
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

/// Address other hosts can reach us on, used as the `@address` part of our identity.
/// Connecting a UDP socket sends nothing; it only selects the outbound interface.
pub fn local_ip() -> Ipv4Addr {
    let probe = || -> io::Result<Ipv4Addr> {
        let sock = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        sock.connect(("8.8.8.8", 80))?;
        match sock.local_addr()? {
            SocketAddr::V4(v4) => Ok(*v4.ip()),
            SocketAddr::V6(_) => Ok(Ipv4Addr::LOCALHOST),
        }
    };
    probe().unwrap_or(Ipv4Addr::LOCALHOST)
}

/// Handles shared by every task.
#[derive(Clone)]
pub struct Daemon {
    pub core: SharedCore,
    pub transport: Arc<Transport>,
    pub chunk_delay: Duration,
}

impl Daemon {
    /// Perform the actions returned by the core. Never holds the core lock.
    pub async fn execute(&self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::Send { to, bytes } => self.transmit(to, &bytes).await,
                OutboundAction::StartChunkStream { file_id } => {
                    tokio::spawn(self.clone().stream_file(file_id));
                }
                OutboundAction::Event(event) => report(&event),
            }
        }
    }

    async fn transmit(&self, to: Destination, bytes: &[u8]) {
        if let Err(e) = self.transport.send(to, bytes).await {
            warn!(%to, error = %e, "send failed");
        }
    }

    /// Pull chunks from the core one at a time, pausing between sends, until the
    /// stream is finished or the receiver rejected it.
    async fn stream_file(self, file_id: String) {
        let mut sent = 0u64;
        loop {
            let actions = self.core.lock().await.next_chunk(&file_id);
            if actions.is_empty() {
                break;
            }
            for action in actions {
                match action {
                    OutboundAction::Send { to, bytes } => {
                        self.transmit(to, &bytes).await;
                        sent += 1;
                    }
                    OutboundAction::Event(event) => report(&event),
                    OutboundAction::StartChunkStream { .. } => {}
                }
            }
            tokio::time::sleep(self.chunk_delay).await;
        }
        debug!(file_id = %file_id, chunks = sent, "chunk stream finished");
    }
}

/// Receive datagrams forever. A bad datagram or a transient socket error never ends the loop.
pub async fn recv_loop(daemon: Daemon) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN + 1];
    loop {
        match daemon.transport.recv(&mut buf).await {
            Ok((n, from)) => {
                let actions = daemon.core.lock().await.on_datagram(&buf[..n], from);
                daemon.execute(actions).await;
            }
            Err(e) => {
                warn!(error = %e, "receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Drive the core's logical clock (retries, peer expiry).
pub async fn tick_loop(daemon: Daemon, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let actions = daemon.core.lock().await.tick();
        daemon.execute(actions).await;
    }
}

/// Rebroadcast our PROFILE periodically. The startup announce is done by the caller.
pub async fn keepalive_loop(daemon: Daemon, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let actions = daemon.core.lock().await.keepalive();
        daemon.execute(actions).await;
    }
}

/// User-facing line for core events; the command loop shares stdout.
fn report(event: &CoreEvent) {
    match event {
        CoreEvent::PeerDiscovered { user_id, addr } => {
            println!("[peer] {user_id} joined from {addr}");
        }
        CoreEvent::PeerExpired { user_id } => println!("[peer] {user_id} timed out"),
        CoreEvent::FileOffered {
            file_id,
            from,
            filename,
            size,
            description,
        } => {
            println!("[file] {from} offers {filename} ({size} bytes) {description}");
            println!("[file] accept {file_id}  |  reject {file_id}");
        }
        CoreEvent::FileSaved(saved) => println!(
            "[file] saved {} ({} bytes, sha256 {})",
            saved.path.display(),
            saved.size,
            saved.sha256
        ),
        CoreEvent::FileRejected { file_id } => println!("[file] {file_id} was rejected"),
        CoreEvent::FileDelivered { file_id } => println!("[file] {file_id} delivered"),
        CoreEvent::TransferAborted { file_id, reason } => {
            println!("[file] {file_id} aborted: {reason}")
        }
        CoreEvent::DeliveryFailed { kind, to, .. } => {
            println!("[warn] {kind} to {to} was never acknowledged")
        }
        CoreEvent::TokenReceived { issuer, .. } => info!(issuer = %issuer, "token granted"),
        CoreEvent::TokenRevoked { token } => debug!(token = %token, "token revoked by peer"),
        CoreEvent::Delivered { message_id, kind } => debug!(message_id = %message_id, %kind, "delivered"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsnp_core::{CoreConfig, LocalProfile, UserId};

    fn core(name: &str) -> SharedCore {
        let profile = LocalProfile::new(UserId::new(name, "127.0.0.1"), name);
        Arc::new(Mutex::new(LsnpCore::new(profile, CoreConfig::default())))
    }

    #[tokio::test]
    async fn unicast_ping_gets_profile_back() {
        let server = Transport::bind(0, Ipv4Addr::LOCALHOST).unwrap();
        let server_port = server.local_addr().unwrap().port();
        let daemon = Daemon {
            core: core("alice"),
            transport: Arc::new(server),
            chunk_delay: Duration::from_millis(1),
        };
        tokio::spawn(recv_loop(daemon));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                b"TYPE: PING\nUSER_ID: bob@127.0.0.1\n\n",
                ("127.0.0.1", server_port),
            )
            .await
            .unwrap();
        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = lsnp_core::decode_envelope(&buf[..n]).unwrap();
        assert_eq!(reply.kind(), &lsnp_core::MessageKind::Profile);
        assert_eq!(reply.get("USER_ID"), Some("alice@127.0.0.1"));
    }

    #[tokio::test]
    async fn garbage_does_not_stop_the_loop() {
        let server = Transport::bind(0, Ipv4Addr::LOCALHOST).unwrap();
        let server_port = server.local_addr().unwrap().port();
        tokio::spawn(recv_loop(Daemon {
            core: core("alice"),
            transport: Arc::new(server),
            chunk_delay: Duration::from_millis(1),
        }));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for junk in [&b"\xff\xfe"[..], b"hello", b"TYPE: ACK\n\n"] {
            client.send_to(junk, ("127.0.0.1", server_port)).await.unwrap();
        }
        client
            .send_to(b"TYPE: PING\nUSER_ID: bob@127.0.0.1\n\n", ("127.0.0.1", server_port))
            .await
            .unwrap();
        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(lsnp_core::decode_envelope(&buf[..n]).is_ok());
    }
}
