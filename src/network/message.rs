// P2P wire protocol messages

use crate::core::serialize::{write_var_string, write_varint, Reader, Serializable};
use crate::core::{hash256, Block, BlockHeader, Hash256, InvKind, Inventory, Transaction};
use crate::error::DecodeError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Protocol version spoken by this node.
pub const PROTOCOL_VERSION: u32 = 60002;

pub const USER_AGENT: &str = "/bitnode:0.1.0/";

/// Wire envelope: magic 4 || command 12 || length 4 LE || checksum 4.
pub const HEADER_SIZE: usize = 24;

/// Hard cap on a single message payload.
pub const MAX_PAYLOAD_SIZE: usize = 0x0200_0000;

/// Most inventory vectors a single inv/getdata may carry.
pub const MAX_INV_ENTRIES: u64 = 50_000;

/// Most addresses a single addr message may carry.
pub const MAX_ADDR_ENTRIES: u64 = 1_000;

/// First four bytes of hash256(payload).
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = hash256(payload);
    let mut sum = [0u8; 4];
    sum.copy_from_slice(&digest.as_bytes()[..4]);
    sum
}

/// A known peer endpoint with the time it was last seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    /// Unix time the peer was last seen
    pub time: u32,
    pub services: u64,
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(ip: IpAddr, port: u16, time: u32) -> Self {
        Self {
            time,
            services: 0,
            ip,
            port,
        }
    }

    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}

fn write_ip(buf: &mut Vec<u8>, ip: &IpAddr) {
    let v6 = match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => *v6,
    };
    buf.extend_from_slice(&v6.octets());
}

fn read_ip(r: &mut Reader) -> Result<IpAddr, DecodeError> {
    let bytes: [u8; 16] = r
        .take(16)?
        .try_into()
        .map_err(|_| DecodeError::Truncated)?;
    let v6 = Ipv6Addr::from(bytes);
    Ok(match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    })
}

/// The 26-byte net_addr block inside a version payload (no timestamp).
fn write_net_addr(buf: &mut Vec<u8>, services: u64, ip: &IpAddr, port: u16) {
    buf.extend_from_slice(&services.to_le_bytes());
    write_ip(buf, ip);
    buf.extend_from_slice(&port.to_be_bytes());
}

fn read_net_addr(r: &mut Reader) -> Result<(u64, IpAddr, u16), DecodeError> {
    let services = r.u64_le()?;
    let ip = read_ip(r)?;
    let port = r.u16_be()?;
    Ok((services, ip, port))
}

/// Payload of the version message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: (u64, IpAddr, u16),
    pub addr_from: (u64, IpAddr, u16),
    /// Random per-connection value; equality on both ends means we
    /// connected to ourselves.
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: u32,
}

impl VersionMessage {
    pub fn new(recv_ip: IpAddr, recv_port: u16, nonce: u64, start_height: u32, timestamp: i64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp,
            addr_recv: (0, recv_ip, recv_port),
            addr_from: (0, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            nonce,
            user_agent: USER_AGENT.to_string(),
            start_height,
        }
    }
}

/// Protocol messages the node understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    GetBlocks { locator: Vec<Hash256>, stop: Hash256 },
    GetHeaders { locator: Vec<Hash256>, stop: Hash256 },
    Headers(Vec<BlockHeader>),
    Block(Block),
    Tx(Transaction),
    Addr(Vec<PeerAddress>),
    GetAddr,
    Ping(u64),
    Pong(u64),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::GetBlocks { .. } => "getblocks",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
        }
    }

    pub fn serialize_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Version(v) => {
                buf.extend_from_slice(&v.version.to_le_bytes());
                buf.extend_from_slice(&v.services.to_le_bytes());
                buf.extend_from_slice(&v.timestamp.to_le_bytes());
                write_net_addr(&mut buf, v.addr_recv.0, &v.addr_recv.1, v.addr_recv.2);
                write_net_addr(&mut buf, v.addr_from.0, &v.addr_from.1, v.addr_from.2);
                buf.extend_from_slice(&v.nonce.to_le_bytes());
                write_var_string(&mut buf, &v.user_agent);
                buf.extend_from_slice(&v.start_height.to_le_bytes());
            }
            Message::Verack | Message::GetAddr => {}
            Message::Inv(items) | Message::GetData(items) => {
                write_varint(&mut buf, items.len() as u64);
                for item in items {
                    buf.extend_from_slice(&item.kind.to_wire().to_le_bytes());
                    buf.extend_from_slice(item.hash.as_bytes());
                }
            }
            Message::GetBlocks { locator, stop } | Message::GetHeaders { locator, stop } => {
                buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
                write_varint(&mut buf, locator.len() as u64);
                for hash in locator {
                    buf.extend_from_slice(hash.as_bytes());
                }
                buf.extend_from_slice(stop.as_bytes());
            }
            Message::Headers(headers) => {
                write_varint(&mut buf, headers.len() as u64);
                for header in headers {
                    header.serialize_into(&mut buf);
                    // headers carry an always-zero tx count
                    buf.push(0x00);
                }
            }
            Message::Block(block) => block.serialize_into(&mut buf),
            Message::Tx(tx) => tx.serialize_into(&mut buf),
            Message::Addr(addrs) => {
                write_varint(&mut buf, addrs.len() as u64);
                for addr in addrs {
                    buf.extend_from_slice(&addr.time.to_le_bytes());
                    write_net_addr(&mut buf, addr.services, &addr.ip, addr.port);
                }
            }
            Message::Ping(nonce) | Message::Pong(nonce) => {
                buf.extend_from_slice(&nonce.to_le_bytes());
            }
        }
        buf
    }

    /// Full wire form: envelope followed by payload.
    pub fn to_wire(&self, magic: [u8; 4]) -> Vec<u8> {
        let payload = self.serialize_payload();
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());

        buf.extend_from_slice(&magic);
        let mut command = [0u8; 12];
        let name = self.command().as_bytes();
        command[..name.len()].copy_from_slice(name);
        buf.extend_from_slice(&command);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&checksum(&payload));
        buf.extend_from_slice(&payload);
        buf
    }

    /// Decode a payload for a command. Unknown commands yield `None` so
    /// the peer loop can skip them with a warning.
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Option<Message>, DecodeError> {
        let mut r = Reader::new(payload);
        let message = match command {
            "version" => {
                let version = r.u32_le()?;
                let services = r.u64_le()?;
                let timestamp = r.i64_le()?;
                let addr_recv = read_net_addr(&mut r)?;
                let addr_from = read_net_addr(&mut r)?;
                let nonce = r.u64_le()?;
                let user_agent = r.var_string()?;
                let start_height = r.u32_le()?;
                Message::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    addr_recv,
                    addr_from,
                    nonce,
                    user_agent,
                    start_height,
                })
            }
            "verack" => Message::Verack,
            "inv" | "getdata" => {
                let count = r.varint()?;
                if count > MAX_INV_ENTRIES {
                    return Err(DecodeError::BadPayload("inv"));
                }
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let kind = InvKind::from_wire(r.u32_le()?)
                        .ok_or(DecodeError::BadPayload("inv"))?;
                    items.push(Inventory {
                        kind,
                        hash: r.hash()?,
                    });
                }
                if command == "inv" {
                    Message::Inv(items)
                } else {
                    Message::GetData(items)
                }
            }
            "getblocks" | "getheaders" => {
                let _version = r.u32_le()?;
                let count = r.varint()?;
                if count > 2_000 {
                    return Err(DecodeError::BadPayload("locator"));
                }
                let mut locator = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    locator.push(r.hash()?);
                }
                let stop = r.hash()?;
                if command == "getblocks" {
                    Message::GetBlocks { locator, stop }
                } else {
                    Message::GetHeaders { locator, stop }
                }
            }
            "headers" => {
                let count = r.varint()?;
                if count > 2_000 {
                    return Err(DecodeError::BadPayload("headers"));
                }
                let mut headers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    headers.push(BlockHeader::deserialize(&mut r)?);
                    // skip the always-zero tx count
                    r.varint()?;
                }
                Message::Headers(headers)
            }
            "block" => Message::Block(Block::deserialize(&mut r)?),
            "tx" => Message::Tx(Transaction::deserialize(&mut r)?),
            "addr" => {
                let count = r.varint()?;
                if count > MAX_ADDR_ENTRIES {
                    return Err(DecodeError::BadPayload("addr"));
                }
                let mut addrs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let time = r.u32_le()?;
                    let (services, ip, port) = read_net_addr(&mut r)?;
                    addrs.push(PeerAddress {
                        time,
                        services,
                        ip,
                        port,
                    });
                }
                Message::Addr(addrs)
            }
            "getaddr" => Message::GetAddr,
            "ping" => Message::Ping(r.u64_le()?),
            "pong" => Message::Pong(r.u64_le()?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

/// Parsed 24-byte message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn deserialize(bytes: &[u8; HEADER_SIZE]) -> Result<Self, DecodeError> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);

        let command_bytes = &bytes[4..16];
        let end = command_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(command_bytes.len());
        let command = std::str::from_utf8(&command_bytes[..end])
            .map_err(|_| DecodeError::BadPayload("command"))?
            .to_string();

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&bytes[16..20]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);

        Ok(Self {
            magic,
            command,
            length: u32::from_le_bytes(length_bytes),
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Network;

    fn round_trip(message: Message) {
        let payload = message.serialize_payload();
        let decoded = Message::decode_payload(message.command(), &payload)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_version_round_trip() {
        let version = VersionMessage::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            8333,
            0xdead_beef,
            42,
            1_700_000_000,
        );
        round_trip(Message::Version(version));
    }

    #[test]
    fn test_inv_round_trip() {
        round_trip(Message::Inv(vec![
            Inventory::block(Hash256::new([1; 32])),
            Inventory::tx(Hash256::new([2; 32])),
        ]));
        round_trip(Message::GetData(vec![Inventory::tx(Hash256::new([3; 32]))]));
    }

    #[test]
    fn test_getblocks_round_trip() {
        round_trip(Message::GetBlocks {
            locator: vec![Hash256::new([1; 32]), Hash256::new([2; 32])],
            stop: Hash256::zero(),
        });
        round_trip(Message::GetHeaders {
            locator: vec![Hash256::new([9; 32])],
            stop: Hash256::zero(),
        });
    }

    #[test]
    fn test_headers_round_trip() {
        let header = BlockHeader::new(1, Hash256::zero(), Hash256::new([5; 32]), 10, 20, 30);
        round_trip(Message::Headers(vec![header.clone(), header]));
    }

    #[test]
    fn test_block_and_tx_round_trip() {
        let genesis = Block::genesis(Network::Mainnet);
        round_trip(Message::Tx(genesis.transactions[0].clone()));
        round_trip(Message::Block(genesis));
    }

    #[test]
    fn test_addr_round_trip() {
        round_trip(Message::Addr(vec![
            PeerAddress::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)), 8333, 1000),
            PeerAddress::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 18333, 2000),
        ]));
    }

    #[test]
    fn test_ping_pong_round_trip() {
        round_trip(Message::Ping(7));
        round_trip(Message::Pong(7));
        round_trip(Message::Verack);
        round_trip(Message::GetAddr);
    }

    #[test]
    fn test_envelope_layout() {
        let magic = Network::Mainnet.magic();
        let wire = Message::Ping(1).to_wire(magic);
        assert_eq!(wire.len(), HEADER_SIZE + 8);

        let header_bytes: [u8; HEADER_SIZE] = wire[..HEADER_SIZE].try_into().unwrap();
        let header = MessageHeader::deserialize(&header_bytes).unwrap();
        assert_eq!(header.magic, magic);
        assert_eq!(header.command, "ping");
        assert_eq!(header.length, 8);
        assert_eq!(header.checksum, checksum(&wire[HEADER_SIZE..]));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let magic = Network::Mainnet.magic();
        let mut wire = Message::Ping(1).to_wire(magic);
        let header_bytes: [u8; HEADER_SIZE] = wire[..HEADER_SIZE].try_into().unwrap();
        let header = MessageHeader::deserialize(&header_bytes).unwrap();

        wire[HEADER_SIZE] ^= 0xff;
        assert_ne!(header.checksum, checksum(&wire[HEADER_SIZE..]));
    }

    #[test]
    fn test_unknown_command_is_skipped() {
        assert_eq!(Message::decode_payload("mempool", &[]).unwrap(), None);
    }

    #[test]
    fn test_truncated_payload_fails() {
        let payload = Message::Ping(7).serialize_payload();
        assert!(Message::decode_payload("ping", &payload[..4]).is_err());
    }

    #[test]
    fn test_oversized_inv_rejected() {
        let mut payload = Vec::new();
        write_varint(&mut payload, MAX_INV_ENTRIES + 1);
        assert!(Message::decode_payload("inv", &payload).is_err());
    }

    #[test]
    fn test_ipv4_mapping_round_trip() {
        let mut buf = Vec::new();
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        write_ip(&mut buf, &ip);
        assert_eq!(buf.len(), 16);
        let mut r = Reader::new(&buf);
        assert_eq!(read_ip(&mut r).unwrap(), ip);
    }
}
