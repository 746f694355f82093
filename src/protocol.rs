//! Discovery protocol message definitions and their binary encoding.
//!
//! Every message starts with a one-byte tag. Integers are little-endian,
//! identifiers are 32 raw bytes, booleans are a single `0` or `1` byte,
//! strings are a `u32` byte length followed by UTF-8, and lists are a `u32`
//! element count followed by the elements.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::{Contact, NodeId};
use crate::error::ProtocolError;

/// Wire tags.
pub mod tag {
    pub const FIND_NODE_REQ: u8 = 0x01;
    pub const FIND_NODE_RESP: u8 = 0x02;
    pub const ADDR_REQ: u8 = 0x03;
    pub const ADDR: u8 = 0x04;
}

/// Maximum number of closer peers in a FindNode response.
pub const MAX_CLOSER_PEERS: usize = 64;

/// Maximum number of entries in an Addr message.
pub const MAX_NODE_ADDRS: usize = 1024;

/// Maximum byte length of an address string.
pub const MAX_ADDRESS_LEN: usize = 256;

/// Ask a peer for the peers it knows closest to a target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FindNodeReq {
    /// The identifier being looked up.
    pub target: NodeId,
    /// Whether this request belongs to a recursive search.
    pub recursive: bool,
}

/// Answer to a [`FindNodeReq`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FindNodeResp {
    /// Echo of the requested target.
    pub target: NodeId,
    /// Echo of the request's recursive flag.
    pub recursive: bool,
    /// True when the responder is the target itself.
    pub success: bool,
    /// The responder's listen address on success; empty otherwise.
    pub address: String,
    /// Closer peers to continue the search with.
    pub closer_peers: Vec<Contact>,
}

/// An advertised peer address in an [`Addr`] message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAddr {
    pub id: NodeId,
    /// IPv6 (or IPv4-mapped) address bytes.
    pub ip: [u8; 16],
    pub port: u16,
}

impl NodeAddr {
    pub fn from_socket_addr(id: NodeId, addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            id,
            ip: ip.octets(),
            port: addr.port(),
        }
    }

    /// The IP in canonical form: IPv4-mapped addresses come back as IPv4.
    pub fn ip_addr(&self) -> IpAddr {
        Ipv6Addr::from(self.ip).to_canonical()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr(), self.port)
    }
}

/// Answer to an address request: the responder's known peers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Addr {
    pub node_addrs: Vec<NodeAddr>,
}

/// All messages exchanged by the discovery protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    FindNodeReq(FindNodeReq),
    FindNodeResp(FindNodeResp),
    AddrReq,
    Addr(Addr),
}

impl Message {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::FindNodeReq(_) => "find_node_req",
            Message::FindNodeResp(_) => "find_node_resp",
            Message::AddrReq => "addr_req",
            Message::Addr(_) => "addr",
        }
    }

    /// Append the encoded message to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Message::FindNodeReq(req) => {
                dst.put_u8(tag::FIND_NODE_REQ);
                dst.put_slice(&req.target);
                put_bool(dst, req.recursive);
            }
            Message::FindNodeResp(resp) => {
                check_len("closer peers", resp.closer_peers.len(), MAX_CLOSER_PEERS)?;
                dst.put_u8(tag::FIND_NODE_RESP);
                dst.put_slice(&resp.target);
                put_bool(dst, resp.recursive);
                put_bool(dst, resp.success);
                put_string(dst, &resp.address)?;
                dst.put_u32_le(resp.closer_peers.len() as u32);
                for peer in &resp.closer_peers {
                    dst.put_slice(&peer.id);
                    put_string(dst, &peer.addr)?;
                }
            }
            Message::AddrReq => dst.put_u8(tag::ADDR_REQ),
            Message::Addr(addr) => {
                check_len("node addrs", addr.node_addrs.len(), MAX_NODE_ADDRS)?;
                dst.put_u8(tag::ADDR);
                dst.put_u32_le(addr.node_addrs.len() as u32);
                for node in &addr.node_addrs {
                    dst.put_slice(&node.id);
                    dst.put_slice(&node.ip);
                    dst.put_u16_le(node.port);
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode exactly one message from `src`.
    ///
    /// Never panics on malformed input; truncated, oversized, or trailing
    /// data is reported as a [`ProtocolError`].
    pub fn decode(mut src: &[u8]) -> Result<Self, ProtocolError> {
        let msg = match take_u8(&mut src, "tag")? {
            tag::FIND_NODE_REQ => Message::FindNodeReq(FindNodeReq {
                target: take_id(&mut src)?,
                recursive: take_bool(&mut src)?,
            }),
            tag::FIND_NODE_RESP => {
                let target = take_id(&mut src)?;
                let recursive = take_bool(&mut src)?;
                let success = take_bool(&mut src)?;
                let address = take_string(&mut src)?;
                let count = take_count(&mut src, "closer peers", MAX_CLOSER_PEERS)?;
                let mut closer_peers = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = take_id(&mut src)?;
                    let addr = take_string(&mut src)?;
                    closer_peers.push(Contact { id, addr });
                }
                Message::FindNodeResp(FindNodeResp {
                    target,
                    recursive,
                    success,
                    address,
                    closer_peers,
                })
            }
            tag::ADDR_REQ => Message::AddrReq,
            tag::ADDR => {
                let count = take_count(&mut src, "node addrs", MAX_NODE_ADDRS)?;
                let mut node_addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = take_id(&mut src)?;
                    let mut ip = [0u8; 16];
                    take_exact(&mut src, &mut ip, "ip address")?;
                    let port = take_u16(&mut src)?;
                    node_addrs.push(NodeAddr { id, ip, port });
                }
                Message::Addr(Addr { node_addrs })
            }
            other => return Err(ProtocolError::UnknownTag(other)),
        };

        if src.has_remaining() {
            return Err(ProtocolError::TrailingBytes(src.remaining()));
        }
        Ok(msg)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Field helpers
// ─────────────────────────────────────────────────────────────────────────────

fn check_len(what: &'static str, len: usize, max: usize) -> Result<(), ProtocolError> {
    if len > max {
        return Err(ProtocolError::TooLong { what, len, max });
    }
    Ok(())
}

fn put_bool(dst: &mut BytesMut, value: bool) {
    dst.put_u8(u8::from(value));
}

fn put_string(dst: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    check_len("address", value.len(), MAX_ADDRESS_LEN)?;
    dst.put_u32_le(value.len() as u32);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn take_u8(src: &mut &[u8], what: &'static str) -> Result<u8, ProtocolError> {
    if src.remaining() < 1 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(src.get_u8())
}

fn take_u16(src: &mut &[u8]) -> Result<u16, ProtocolError> {
    if src.remaining() < 2 {
        return Err(ProtocolError::Truncated("port"));
    }
    Ok(src.get_u16_le())
}

fn take_u32(src: &mut &[u8], what: &'static str) -> Result<u32, ProtocolError> {
    if src.remaining() < 4 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(src.get_u32_le())
}

fn take_exact(src: &mut &[u8], out: &mut [u8], what: &'static str) -> Result<(), ProtocolError> {
    if src.remaining() < out.len() {
        return Err(ProtocolError::Truncated(what));
    }
    src.copy_to_slice(out);
    Ok(())
}

fn take_id(src: &mut &[u8]) -> Result<NodeId, ProtocolError> {
    let mut id = [0u8; 32];
    take_exact(src, &mut id, "node id")?;
    Ok(id)
}

fn take_bool(src: &mut &[u8]) -> Result<bool, ProtocolError> {
    match take_u8(src, "bool")? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::InvalidBool(other)),
    }
}

fn take_count(src: &mut &[u8], what: &'static str, max: usize) -> Result<usize, ProtocolError> {
    let len = take_u32(src, what)? as usize;
    check_len(what, len, max)?;
    Ok(len)
}

fn take_string(src: &mut &[u8]) -> Result<String, ProtocolError> {
    let len = take_count(src, "address", MAX_ADDRESS_LEN)?;
    let mut raw = vec![0u8; len];
    take_exact(src, &mut raw, "address")?;
    String::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> NodeId {
        [byte; 32]
    }

    fn round_trip(msg: &Message) -> Message {
        let bytes = msg.to_bytes().expect("encodes");
        Message::decode(&bytes).expect("decodes")
    }

    #[test]
    fn find_node_req_round_trips() {
        let msg = Message::FindNodeReq(FindNodeReq {
            target: id(7),
            recursive: true,
        });
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn find_node_resp_round_trips_empty_and_full() {
        let empty = Message::FindNodeResp(FindNodeResp {
            target: id(1),
            recursive: false,
            success: true,
            address: "10.0.0.1:20338".into(),
            closer_peers: Vec::new(),
        });
        assert_eq!(round_trip(&empty), empty);

        let full = Message::FindNodeResp(FindNodeResp {
            target: id(2),
            recursive: true,
            success: false,
            address: String::new(),
            closer_peers: (0..MAX_CLOSER_PEERS)
                .map(|i| Contact::new(id(i as u8), format!("10.0.{i}.1:{}", 1000 + i)))
                .collect(),
        });
        assert_eq!(round_trip(&full), full);
    }

    #[test]
    fn addr_round_trips_empty_and_full() {
        assert_eq!(round_trip(&Message::AddrReq), Message::AddrReq);

        let empty = Message::Addr(Addr::default());
        assert_eq!(round_trip(&empty), empty);

        let full = Message::Addr(Addr {
            node_addrs: (0..MAX_NODE_ADDRS)
                .map(|i| {
                    let addr: SocketAddr = format!("10.{}.{}.1:{}", i / 256, i % 256, 20000 + i)
                        .parse()
                        .expect("valid socket addr");
                    NodeAddr::from_socket_addr(id((i % 256) as u8), addr)
                })
                .collect(),
        });
        assert_eq!(round_trip(&full), full);
    }

    #[test]
    fn node_addr_canonicalises_ipv4() {
        let addr: SocketAddr = "10.0.0.1:20338".parse().expect("valid");
        let node = NodeAddr::from_socket_addr(id(1), addr);
        assert_eq!(node.socket_addr(), addr);
        assert_eq!(node.ip_addr().to_string(), "10.0.0.1");
    }

    #[test]
    fn encode_rejects_oversized_lists() {
        let msg = Message::FindNodeResp(FindNodeResp {
            target: id(0),
            recursive: false,
            success: false,
            address: String::new(),
            closer_peers: vec![Contact::new(id(0), "x"); MAX_CLOSER_PEERS + 1],
        });
        assert!(matches!(
            msg.to_bytes(),
            Err(ProtocolError::TooLong { .. })
        ));
    }

    #[test]
    fn decode_rejects_every_truncation() {
        let msg = Message::FindNodeResp(FindNodeResp {
            target: id(3),
            recursive: true,
            success: false,
            address: "10.0.0.3:1".into(),
            closer_peers: vec![Contact::new(id(4), "10.0.0.4:1")],
        });
        let bytes = msg.to_bytes().expect("encodes");
        for cut in 0..bytes.len() {
            assert!(Message::decode(&bytes[..cut]).is_err(), "prefix {cut} decoded");
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(Message::decode(&[0xFF]), Err(ProtocolError::UnknownTag(0xFF)));

        let mut bad_bool = vec![tag::FIND_NODE_REQ];
        bad_bool.extend_from_slice(&id(1));
        bad_bool.push(2);
        assert_eq!(Message::decode(&bad_bool), Err(ProtocolError::InvalidBool(2)));

        let mut trailing = Message::AddrReq.to_bytes().expect("encodes").to_vec();
        trailing.push(0);
        assert_eq!(Message::decode(&trailing), Err(ProtocolError::TrailingBytes(1)));

        let mut huge = vec![tag::ADDR];
        huge.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Message::decode(&huge),
            Err(ProtocolError::TooLong { .. })
        ));
    }
}
