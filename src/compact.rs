//! BEP-5 compact wire encodings, IPv4 only: 26 bytes per node
//! (20-byte id, 4-byte address, 2-byte port), 6 bytes per peer.

use std::{
    convert::TryInto,
    net::{Ipv4Addr, SocketAddrV4},
};

const SOCKET_ADDR_LEN: usize = 6;

/// Serialize/deserialize a `Vec<SocketAddrV4>` as a list of compact peer
/// byte strings (the `values` key of a get_peers response).
pub(crate) mod peers {
    use super::SOCKET_ADDR_LEN;
    use serde::{
        de::{Deserializer, Error as _, SeqAccess, Visitor},
        ser::{SerializeSeq, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::{fmt, net::SocketAddrV4};

    pub(crate) fn serialize<S>(addrs: &[SocketAddrV4], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = s.serialize_seq(Some(addrs.len()))?;
        for addr in addrs {
            seq.serialize_element(Bytes::new(&super::encode_socket_addr(addr)))?
        }
        seq.end()
    }

    pub(crate) fn deserialize<'de, D>(d: D) -> Result<Vec<SocketAddrV4>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PeersVisitor;

        impl<'de> Visitor<'de> for PeersVisitor {
            type Value = Vec<SocketAddrV4>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "list of {}-byte strings", SOCKET_ADDR_LEN)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut output = Vec::with_capacity(seq.size_hint().unwrap_or(0));

                while let Some(bytes) = seq.next_element::<ByteBuf>()? {
                    let addr = super::decode_socket_addr(&bytes)
                        .ok_or_else(|| A::Error::invalid_length(bytes.len(), &self))?;
                    output.push(addr);
                }

                Ok(output)
            }
        }

        d.deserialize_seq(PeersVisitor)
    }
}

/// Serialize/deserialize a `Vec<ContactInfo>` as a single byte string of
/// concatenated 26-byte entries (the `nodes` key).
pub(crate) mod nodes {
    use super::SOCKET_ADDR_LEN;
    use crate::{
        id::{NodeId, ID_LEN},
        routing::node::ContactInfo,
    };
    use serde::{
        de::{Deserialize, Deserializer, Error as _},
        ser::Serializer,
    };
    use serde_bytes::ByteBuf;
    use std::convert::TryFrom;

    const NODE_LEN: usize = ID_LEN + SOCKET_ADDR_LEN;

    pub(crate) fn serialize<S>(nodes: &[ContactInfo], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut buffer = Vec::with_capacity(nodes.len() * NODE_LEN);

        for node in nodes {
            buffer.extend(node.id.as_ref());
            buffer.extend(super::encode_socket_addr(&node.addr));
        }

        s.serialize_bytes(&buffer)
    }

    pub(crate) fn deserialize<'de, D>(d: D) -> Result<Vec<ContactInfo>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buffer = ByteBuf::deserialize(d)?;
        let chunks = buffer.chunks_exact(NODE_LEN);

        if !chunks.remainder().is_empty() {
            let msg = format!("multiple of {}", NODE_LEN);
            return Err(D::Error::invalid_length(buffer.len(), &msg.as_ref()));
        }

        let nodes = chunks
            .filter_map(|chunk| {
                let id = NodeId::try_from(&chunk[..ID_LEN]).ok()?;
                let addr = super::decode_socket_addr(&chunk[ID_LEN..])?;

                Some(ContactInfo { id, addr })
            })
            .collect();

        Ok(nodes)
    }
}

fn decode_socket_addr(src: &[u8]) -> Option<SocketAddrV4> {
    if src.len() != SOCKET_ADDR_LEN {
        return None;
    }

    let ip: [u8; 4] = src.get(..4)?.try_into().ok()?;
    let port = u16::from_be_bytes(src.get(4..)?.try_into().ok()?);

    Some(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

fn encode_socket_addr(addr: &SocketAddrV4) -> [u8; SOCKET_ADDR_LEN] {
    let mut buffer = [0u8; SOCKET_ADDR_LEN];
    buffer[..4].copy_from_slice(&addr.ip().octets());
    buffer[4..].copy_from_slice(&addr.port().to_be_bytes());
    buffer
}

#[cfg(test)]
mod tests {
    use crate::{id::NodeId, routing::node::ContactInfo};
    use serde::{Deserialize, Serialize};
    use std::{
        fmt::Debug,
        net::{Ipv4Addr, SocketAddrV4},
    };

    #[test]
    fn encode_decode_peers() {
        #[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        struct Wrapper {
            #[serde(with = "super::peers")]
            values: Vec<SocketAddrV4>,
        }

        encode_decode(&Wrapper { values: Vec::new() }, b"le");
        encode_decode(
            &Wrapper {
                values: vec![SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6789)],
            },
            &[b'l', b'6', b':', 127, 0, 0, 1, 26, 133, b'e'],
        );
        encode_decode(
            &Wrapper {
                values: vec![
                    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6789),
                    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 2), 1234),
                ],
            },
            &[
                b'l', b'6', b':', 127, 0, 0, 1, 26, 133, b'6', b':', 127, 0, 0, 2, 4, 210, b'e',
            ],
        );
    }

    #[test]
    fn encode_decode_nodes() {
        #[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        struct Wrapper {
            #[serde(with = "super::nodes")]
            nodes: Vec<ContactInfo>,
        }

        encode_decode(&Wrapper { nodes: Vec::new() }, b"0:");
        encode_decode(
            &Wrapper {
                nodes: vec![ContactInfo {
                    id: NodeId::from(*b"0123456789abcdefghij"),
                    addr: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6789),
                }],
            },
            &[
                b'2', b'6', b':', b'0', b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'a',
                b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j', 127, 0, 0, 1, 26, 133,
            ],
        );
        encode_decode(
            &Wrapper {
                nodes: vec![
                    ContactInfo {
                        id: NodeId::from(*b"0123456789abcdefghij"),
                        addr: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6789),
                    },
                    ContactInfo {
                        id: NodeId::from(*b"klmnopqrstuvwxyz0123"),
                        addr: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 2), 1234),
                    },
                ],
            },
            &[
                b'5', b'2', b':', b'0', b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'a',
                b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j', 127, 0, 0, 1, 26, 133, b'k',
                b'l', b'm', b'n', b'o', b'p', b'q', b'r', b's', b't', b'u', b'v', b'w', b'x', b'y',
                b'z', b'0', b'1', b'2', b'3', 127, 0, 0, 2, 4, 210,
            ],
        );
    }

    #[test]
    fn reject_truncated_node_list() {
        #[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        struct Wrapper {
            #[serde(with = "super::nodes")]
            nodes: Vec<ContactInfo>,
        }

        // 25 bytes: one byte short of a full entry.
        let mut encoded = b"25:".to_vec();
        encoded.extend_from_slice(&[0u8; 25]);

        assert!(serde_bencode::from_bytes::<Wrapper>(&encoded).is_err());
    }

    fn encode_decode<'de, T>(value: &T, expected_encoded: &'de [u8])
    where
        T: Serialize + Deserialize<'de> + Eq + Debug,
    {
        let actual_encoded = serde_bencode::to_bytes(value).unwrap();
        assert_eq!(actual_encoded, expected_encoded);

        let actual_decoded: T = serde_bencode::from_bytes(expected_encoded).unwrap();
        assert_eq!(actual_decoded, *value);
    }
}
