// Peer connection: framing, handshake, state

use crate::core::Network;
use crate::error::{NetworkError, Result};
use crate::network::message::{
    checksum, Message, MessageHeader, VersionMessage, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Connection lifecycle. Only `Connected` peers take part in inventory
/// and block requests; `Closing` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Connected,
    Closing,
}

/// What we know about a peer after the handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub version: u32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: u32,
    /// Unix time of the last message from this peer
    pub last_seen: u64,
    pub outbound: bool,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, outbound: bool) -> Self {
        Self {
            addr,
            version: 0,
            services: 0,
            user_agent: String::new(),
            start_height: 0,
            last_seen: unix_time(),
            outbound,
        }
    }
}

pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Write one framed message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    magic: [u8; 4],
    message: &Message,
) -> Result<()> {
    let wire = message.to_wire(magic);
    stream.write_all(&wire).await.map_err(NetworkError::Io)?;
    stream.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

/// Read one framed message, validating magic and checksum. Unknown
/// commands are skipped and reported as `None`.
pub async fn read_message<R: AsyncRead + Unpin>(
    stream: &mut R,
    magic: [u8; 4],
) -> Result<Option<Message>> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    stream
        .read_exact(&mut header_bytes)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => NetworkError::Closed,
            _ => NetworkError::Io(e),
        })?;

    let header = MessageHeader::deserialize(&header_bytes)?;
    if header.magic != magic {
        return Err(NetworkError::BadMagic.into());
    }
    if header.length as usize > MAX_PAYLOAD_SIZE {
        return Err(NetworkError::Oversized(header.length as usize).into());
    }

    let mut payload = vec![0u8; header.length as usize];
    if !payload.is_empty() {
        stream
            .read_exact(&mut payload)
            .await
            .map_err(NetworkError::Io)?;
    }

    if checksum(&payload) != header.checksum {
        return Err(NetworkError::BadChecksum(header.command).into());
    }

    match Message::decode_payload(&header.command, &payload)? {
        Some(message) => Ok(Some(message)),
        None => {
            log::warn!("unknown command '{}' skipped", header.command);
            Ok(None)
        }
    }
}

/// One TCP connection speaking the 24-byte message envelope.
pub struct Peer {
    stream: TcpStream,
    magic: [u8; 4],
    pub info: PeerInfo,
    pub state: PeerState,
}

impl Peer {
    /// Wrap an accepted inbound connection.
    pub fn inbound(stream: TcpStream, addr: SocketAddr, network: Network) -> Self {
        Self {
            stream,
            magic: network.magic(),
            info: PeerInfo::new(addr, false),
            state: PeerState::Connecting,
        }
    }

    /// Dial a peer, with a connect timeout.
    pub async fn connect(addr: SocketAddr, network: Network, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::Connect(e.to_string()))?;

        Ok(Self {
            stream,
            magic: network.magic(),
            info: PeerInfo::new(addr, true),
            state: PeerState::Connecting,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.info.addr
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        write_message(&mut self.stream, self.magic, message).await
    }

    pub async fn receive(&mut self) -> Result<Option<Message>> {
        let message = read_message(&mut self.stream, self.magic).await?;
        self.info.last_seen = unix_time();
        Ok(message)
    }

    /// Mutual version/verack exchange. Both sides announce immediately
    /// and acknowledge the other's version; completion moves the peer to
    /// `Connected`.
    pub async fn handshake(&mut self, nonce: u64, start_height: u32) -> Result<()> {
        self.state = PeerState::Handshaking;

        let version = VersionMessage::new(
            self.info.addr.ip(),
            self.info.addr.port(),
            nonce,
            start_height,
            unix_time() as i64,
        );
        self.send(&Message::Version(version)).await?;

        let mut got_version = false;
        let mut got_verack = false;
        while !(got_version && got_verack) {
            match self.receive().await? {
                Some(Message::Version(v)) => {
                    if v.nonce == nonce {
                        return Err(NetworkError::Handshake("connected to self".into()).into());
                    }
                    self.info.version = v.version;
                    self.info.services = v.services;
                    self.info.user_agent = v.user_agent;
                    self.info.start_height = v.start_height;
                    got_version = true;
                    self.send(&Message::Verack).await?;
                }
                Some(Message::Verack) => got_verack = true,
                Some(other) => {
                    return Err(NetworkError::Handshake(format!(
                        "unexpected '{}' during handshake",
                        other.command()
                    ))
                    .into());
                }
                None => {}
            }
        }

        self.state = PeerState::Connected;
        Ok(())
    }

    /// Split into independent read and write halves for the node's
    /// reader/writer tasks.
    pub fn into_split(self) -> (PeerReader, PeerWriter, PeerInfo) {
        let (read, write) = self.stream.into_split();
        (
            PeerReader {
                half: read,
                magic: self.magic,
            },
            PeerWriter {
                half: write,
                magic: self.magic,
            },
            self.info,
        )
    }
}

pub struct PeerReader {
    half: OwnedReadHalf,
    magic: [u8; 4],
}

impl PeerReader {
    pub async fn receive(&mut self) -> Result<Option<Message>> {
        read_message(&mut self.half, self.magic).await
    }
}

pub struct PeerWriter {
    half: OwnedWriteHalf,
    magic: [u8; 4],
}

impl PeerWriter {
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        write_message(&mut self.half, self.magic, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn peer_pair() -> (Peer, Peer) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            Peer::inbound(stream, peer_addr, Network::Regtest)
        });

        let outbound = Peer::connect(addr, Network::Regtest, Duration::from_secs(5))
            .await
            .unwrap();
        let inbound = accept.await.unwrap();
        (outbound, inbound)
    }

    #[tokio::test]
    async fn test_handshake_both_sides() {
        let (mut outbound, mut inbound) = peer_pair().await;
        let inbound_task = tokio::spawn(async move {
            inbound.handshake(2, 7).await.unwrap();
            inbound
        });

        outbound.handshake(1, 5).await.unwrap();
        let inbound = inbound_task.await.unwrap();

        assert_eq!(outbound.state, PeerState::Connected);
        assert_eq!(inbound.state, PeerState::Connected);
        assert_eq!(outbound.info.start_height, 7);
        assert_eq!(inbound.info.start_height, 5);
    }

    #[tokio::test]
    async fn test_self_connect_detected() {
        let (mut outbound, mut inbound) = peer_pair().await;

        // same nonce on both ends means we dialed ourselves
        let inbound_task = tokio::spawn(async move {
            let _ = inbound.handshake(9, 0).await;
        });
        let err = outbound.handshake(9, 0).await;
        assert!(err.is_err());
        inbound_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_message_exchange() {
        let (mut outbound, mut inbound) = peer_pair().await;

        outbound.send(&Message::Ping(41)).await.unwrap();
        match inbound.receive().await.unwrap() {
            Some(Message::Ping(nonce)) => {
                inbound.send(&Message::Pong(nonce)).await.unwrap();
            }
            other => panic!("expected ping, got {:?}", other),
        }
        assert_eq!(outbound.receive().await.unwrap(), Some(Message::Pong(41)));
    }

    #[tokio::test]
    async fn test_split_halves_work_independently() {
        let (outbound, mut inbound) = peer_pair().await;
        let (mut reader, mut writer, _info) = outbound.into_split();

        writer.send(&Message::Ping(1)).await.unwrap();
        assert_eq!(inbound.receive().await.unwrap(), Some(Message::Ping(1)));

        inbound.send(&Message::Pong(1)).await.unwrap();
        assert_eq!(reader.receive().await.unwrap(), Some(Message::Pong(1)));
    }

    #[tokio::test]
    async fn test_closed_connection_reported() {
        let (mut outbound, inbound) = peer_pair().await;
        drop(inbound);

        match outbound.receive().await {
            Err(crate::error::Error::Network(NetworkError::Closed)) => {}
            other => panic!("expected Closed, got {:?}", other.map(|_| ())),
        }
    }
}
