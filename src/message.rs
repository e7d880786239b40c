use crate::{
    compact,
    id::{InfoHash, NodeId},
    routing::node::ContactInfo,
};
use serde::{
    de::{Deserializer, Error as _, IgnoredAny, SeqAccess, Visitor},
    ser::{SerializeSeq, Serializer},
    Deserialize, Serialize,
};
use std::{fmt, net::SocketAddrV4};

/// A KRPC message: transaction id plus a query, response or error body.
#[derive(Clone, Eq, PartialEq, Debug, Serialize)]
pub(crate) struct Message {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,
    #[serde(flatten)]
    pub body: MessageBody,
}

// `MessageBody`'s derived `Deserialize` combines an internally tagged enum
// (`tag = "y"`) with `#[serde(flatten)]` on this struct, and `Request` further
// nests an adjacently tagged enum (`tag = "q", content = "a"`) inside that.
// serde buffers flattened/tagged input through its generic `Content` type
// before re-dispatching to the right variant, and `serde_bencode`'s
// `Deserializer` mishandles that buffered re-dispatch for the adjacently
// tagged case, so decoding (though not encoding) panics-free callers would
// get a spurious `InvalidType` error. Round-tripping each sub-value through
// real bencode bytes (rather than serde's `Content` buffer) sidesteps it.
impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "t", with = "serde_bytes")]
            t: Vec<u8>,
            #[serde(rename = "y", with = "serde_bytes")]
            y: Vec<u8>,
            #[serde(rename = "q", default, with = "serde_bytes")]
            q: Option<Vec<u8>>,
            #[serde(rename = "a", default)]
            a: Option<serde_bencode::value::Value>,
            #[serde(rename = "r", default)]
            r: Option<serde_bencode::value::Value>,
            #[serde(rename = "e", default)]
            e: Option<serde_bencode::value::Value>,
        }

        fn decode_field<T: serde::de::DeserializeOwned, E: serde::de::Error>(
            value: Option<serde_bencode::value::Value>,
            field: &'static str,
        ) -> Result<T, E> {
            let value = value.ok_or_else(|| E::missing_field(field))?;
            let bytes = serde_bencode::to_bytes(&value).map_err(E::custom)?;
            serde_bencode::from_bytes(&bytes).map_err(E::custom)
        }

        let raw = Raw::deserialize(d)?;

        let body = match raw.y.as_slice() {
            b"q" => {
                let method = raw.q.ok_or_else(|| D::Error::missing_field("q"))?;
                let request = match method.as_slice() {
                    b"ping" => Request::Ping(decode_field(raw.a, "a")?),
                    b"find_node" => Request::FindNode(decode_field(raw.a, "a")?),
                    b"get_peers" => Request::GetPeers(decode_field(raw.a, "a")?),
                    b"announce_peer" => Request::AnnouncePeer(decode_field(raw.a, "a")?),
                    _ => {
                        return Err(D::Error::custom(format!(
                            "unknown query method: {}",
                            String::from_utf8_lossy(&method)
                        )))
                    }
                };
                MessageBody::Request(request)
            }
            b"r" => MessageBody::Response(decode_field(raw.r, "r")?),
            b"e" => MessageBody::Error(decode_field(raw.e, "e")?),
            other => {
                return Err(D::Error::custom(format!(
                    "unknown message type: {}",
                    String::from_utf8_lossy(other)
                )))
            }
        };

        Ok(Message {
            transaction_id: raw.t,
            body,
        })
    }
}

impl Message {
    /// Decode the message from bencode.
    pub fn decode(input: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(input)
    }

    /// Encode the message into bencode.
    pub fn encode(&self) -> Vec<u8> {
        // Serializing into a `Vec` can only fail on a bug in our own
        // serialize impls.
        serde_bencode::to_bytes(self).expect("failed to serialize message")
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "y")]
pub(crate) enum MessageBody {
    #[serde(rename = "q")]
    Request(Request),
    #[serde(rename = "r", with = "unflatten::response")]
    Response(Response),
    #[serde(rename = "e", with = "unflatten::error")]
    Error(ErrorBody),
}

// Opposite of `serde(flatten)` - artificially add one level of nesting to a field.
mod unflatten {
    macro_rules! impl_unflatten {
        ($mod:ident, $field:literal) => {
            pub(crate) mod $mod {
                use serde::{Deserialize, Deserializer, Serialize, Serializer};

                #[derive(Serialize, Deserialize)]
                struct Wrapper<T> {
                    #[serde(rename = $field)]
                    field: T,
                }

                pub(crate) fn serialize<T: Serialize, S: Serializer>(
                    value: &T,
                    s: S,
                ) -> Result<S::Ok, S::Error> {
                    Wrapper { field: value }.serialize(s)
                }

                pub(crate) fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
                    d: D,
                ) -> Result<T, D::Error> {
                    let wrapper = Wrapper::deserialize(d)?;
                    Ok(wrapper.field)
                }
            }
        };
    }

    impl_unflatten!(response, "r");
    impl_unflatten!(error, "e");
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "q", content = "a")]
#[serde(rename_all = "snake_case")]
pub(crate) enum Request {
    Ping(PingRequest),
    FindNode(FindNodeRequest),
    GetPeers(GetPeersRequest),
    AnnouncePeer(AnnouncePeerRequest),
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct PingRequest {
    pub id: NodeId,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct FindNodeRequest {
    pub id: NodeId,
    pub target: NodeId,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct GetPeersRequest {
    pub id: NodeId,
    pub info_hash: InfoHash,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct AnnouncePeerRequest {
    pub id: NodeId,

    #[serde(
        default,
        skip_serializing_if = "is_false",
        serialize_with = "bool_to_int",
        deserialize_with = "bool_from_int"
    )]
    pub implied_port: bool,

    pub info_hash: InfoHash,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
}

impl AnnouncePeerRequest {
    /// Resolve the port peers should connect to: the explicit `port` when
    /// it is provided and not overridden by `implied_port`; in every other
    /// case the announcer's UDP source port.
    pub fn connect_port(&self, from: SocketAddrV4) -> u16 {
        self.port
            .filter(|_| !self.implied_port)
            .unwrap_or_else(|| from.port())
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn bool_to_int<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u8(u8::from(*value))
}

fn bool_from_int<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let num = u8::deserialize(d)?;
    Ok(num > 0)
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum Response {
    // NOTE: the order of the variants matters: `untagged` picks the first
    // one that fits, and every response carries an `id`.
    GetPeers(GetPeersResponse),
    FindNode(FindNodeResponse),
    // Reply to either `ping` or `announce_peer`; the two are only told apart
    // by the transaction they resolve.
    Ack(AckResponse),
}

impl Response {
    pub fn id(&self) -> NodeId {
        match self {
            Response::GetPeers(r) => r.id,
            Response::FindNode(r) => r.id,
            Response::Ack(r) => r.id,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct AckResponse {
    pub id: NodeId,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct FindNodeResponse {
    pub id: NodeId,

    #[serde(with = "compact::nodes")]
    pub nodes: Vec<ContactInfo>,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct GetPeersResponse {
    pub id: NodeId,

    #[serde(with = "compact::nodes", default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<ContactInfo>,

    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,

    #[serde(with = "compact::peers", default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<SocketAddrV4>,
}

/// The `e` body: a two element list of numeric code and message.
#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct ErrorBody {
    pub code: u8,
    pub message: String,
}

impl Serialize for ErrorBody {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(2))?;
        seq.serialize_element(&self.code)?;
        seq.serialize_element(&self.message)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for ErrorBody {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct ErrorBodyVisitor;

        impl<'de> Visitor<'de> for ErrorBodyVisitor {
            type Value = ErrorBody;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a list of two elements: an integer and a string")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let code: u8 = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(0, &self))?;
                let message = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(1, &self))?;

                // Make sure the list is consumed to the end.
                if seq.next_element::<IgnoredAny>()?.is_some() {
                    return Err(A::Error::invalid_length(3, &self));
                }

                Ok(ErrorBody { code, message })
            }
        }

        d.deserialize_seq(ErrorBodyVisitor)
    }
}

pub(crate) mod error_code {
    #![allow(unused)]

    pub const GENERIC_ERROR: u8 = 201;
    pub const SERVER_ERROR: u8 = 202;
    pub const PROTOCOL_ERROR: u8 = 203;
    pub const METHOD_UNKNOWN: u8 = 204;
}

/// Names of the query methods this node understands. Used to tell an unknown
/// method apart from a malformed known one when the full decode fails.
const KNOWN_METHODS: [&[u8]; 4] = [b"ping", b"find_node", b"get_peers", b"announce_peer"];

/// Minimal decode of a datagram that failed to parse as a full [`Message`]:
/// just enough to echo the transaction id back in an error reply.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,
    #[serde(rename = "y", with = "serde_bytes")]
    pub kind: Vec<u8>,
    #[serde(rename = "q", default, with = "serde_bytes")]
    pub method: Option<Vec<u8>>,
}

impl Envelope {
    pub fn decode(input: &[u8]) -> Option<Self> {
        serde_bencode::from_bytes(input).ok()
    }

    /// Is this a query whose method we do not implement (as opposed to a
    /// malformed rendition of one we do)?
    pub fn is_unknown_query(&self) -> bool {
        self.kind == b"q"
            && self
                .method
                .as_deref()
                .map_or(true, |method| !KNOWN_METHODS.contains(&method))
    }
}
