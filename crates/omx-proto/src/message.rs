//! Typed messages and their encoding.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::IntoBytes;

use crate::{
    EndpointAddr, MessageHeader, MessageType, ProtocolError, SERVICE_NAME_CAPACITY,
};

/// Broker answer to a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Zero on success, a remote error code otherwise.
    pub status: u32,
    /// Address the session must use as destination once connected.
    pub addr: EndpointAddr,
}

impl ConnectResponse {
    /// Encoded payload size.
    pub const SIZE: usize = 8;

    /// Whether the broker accepted the connection.
    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    /// Read a response from a CONNECT_RESPONSE payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                expected: MessageHeader::SIZE + Self::SIZE,
                actual: MessageHeader::SIZE + payload.len(),
            });
        }
        Ok(Self { status: read_u32(payload, 0), addr: read_u32(payload, 4) })
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Connect to the named remote component.
    ConnectRequest {
        /// Service name, validated by [`validate_service_name`].
        name: String,
    },
    /// Broker answer to [`Message::ConnectRequest`].
    ConnectResponse(ConnectResponse),
    /// Keepalive probe.
    Ping,
    /// Keepalive answer.
    Pong,
    /// Tear down the connection whose remote address is `addr`.
    Disconnect {
        /// Destination address being torn down.
        addr: EndpointAddr,
    },
    /// Opaque application payload.
    Raw(Bytes),
}

impl Message {
    /// Wire type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ConnectRequest { .. } => MessageType::ConnectRequest,
            Self::ConnectResponse(_) => MessageType::ConnectResponse,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::Disconnect { .. } => MessageType::Disconnect,
            Self::Raw(_) => MessageType::Raw,
        }
    }

    /// Encode header and payload.
    ///
    /// Connect requests are always emitted with the full fixed-size name
    /// field while the header length counts only the name and its NUL.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();

        match self {
            Self::ConnectRequest { name } => {
                validate_service_name(name)?;
                buf.reserve(MessageHeader::SIZE + SERVICE_NAME_CAPACITY);
                put_header(&mut buf, MessageType::ConnectRequest, name.len() + 1)?;
                let mut field = [0u8; SERVICE_NAME_CAPACITY];
                field[..name.len()].copy_from_slice(name.as_bytes());
                buf.put_slice(&field);
            },
            Self::ConnectResponse(rsp) => {
                put_header(&mut buf, MessageType::ConnectResponse, ConnectResponse::SIZE)?;
                buf.put_u32_le(rsp.status);
                buf.put_u32_le(rsp.addr);
            },
            Self::Ping | Self::Pong => {
                put_header(&mut buf, self.message_type(), 0)?;
            },
            Self::Disconnect { addr } => {
                put_header(&mut buf, MessageType::Disconnect, 4)?;
                buf.put_u32_le(*addr);
            },
            Self::Raw(payload) => return Ok(Self::raw_frame(payload)?.freeze()),
        }

        Ok(buf.freeze())
    }

    /// Build a mutable RAW frame so the payload can still be rewritten in
    /// place (see [`crate::rewrite_buffer_refs`]) before it is sent.
    ///
    /// Fails with [`ProtocolError::PayloadTooLarge`] if the length does not
    /// fit the header's 32-bit length field.
    pub fn raw_frame(payload: &[u8]) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(MessageHeader::SIZE + payload.len());
        put_header(&mut buf, MessageType::Raw, payload.len())?;
        buf.put_slice(payload);
        Ok(buf)
    }

    /// Decode one message.
    ///
    /// Bytes past the declared payload length are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (header, payload) = split_frame(bytes)?;
        let msg_type =
            header.message_type().ok_or(ProtocolError::UnknownType(header.msg_type()))?;

        match msg_type {
            MessageType::ConnectRequest => {
                let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                let name = String::from_utf8_lossy(&payload[..end]).into_owned();
                Ok(Self::ConnectRequest { name })
            },
            MessageType::ConnectResponse => ConnectResponse::parse(payload).map(Self::ConnectResponse),
            MessageType::Ping => Ok(Self::Ping),
            MessageType::Pong => Ok(Self::Pong),
            MessageType::Disconnect => {
                if payload.len() < 4 {
                    return Err(ProtocolError::Truncated {
                        expected: MessageHeader::SIZE + 4,
                        actual: MessageHeader::SIZE + payload.len(),
                    });
                }
                Ok(Self::Disconnect { addr: read_u32(payload, 0) })
            },
            MessageType::Raw => Ok(Self::Raw(Bytes::copy_from_slice(payload))),
        }
    }
}

/// Split a received frame into its header and exactly `len` payload bytes,
/// without copying.
pub fn split_frame(bytes: &[u8]) -> Result<(&MessageHeader, &[u8]), ProtocolError> {
    let (header, rest) = MessageHeader::split(bytes)?;
    let len = header.payload_len();
    if rest.len() < len {
        return Err(ProtocolError::Truncated {
            expected: MessageHeader::SIZE + len,
            actual: bytes.len(),
        });
    }
    Ok((header, &rest[..len]))
}

/// Check that `name` fits the connect request name field.
///
/// The name must be non-empty, free of NUL bytes and leave room for the
/// terminating NUL.
pub fn validate_service_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::EmptyName);
    }
    if name.as_bytes().contains(&0) {
        return Err(ProtocolError::NameContainsNul);
    }
    let max = SERVICE_NAME_CAPACITY - 1;
    if name.len() > max {
        return Err(ProtocolError::NameTooLong { len: name.len(), max });
    }
    Ok(())
}

fn put_header(buf: &mut BytesMut, msg_type: MessageType, len: usize) -> Result<(), ProtocolError> {
    let header = MessageHeader::new(msg_type, wire_len(len)?);
    buf.put_slice(header.as_bytes());
    Ok(())
}

fn wire_len(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::PayloadTooLarge { len })
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn connect_request_uses_fixed_name_field() {
        let msg = Message::ConnectRequest { name: "svcA".to_string() };
        let bytes = msg.encode().unwrap();

        assert_eq!(bytes.len(), MessageHeader::SIZE + SERVICE_NAME_CAPACITY);
        assert_eq!(&bytes[..12], hex!("00000000 00000000 05000000"));
        assert_eq!(&bytes[12..17], b"svcA\0");
        assert!(bytes[17..].iter().all(|&b| b == 0));
    }

    #[test]
    fn connect_request_decodes_name() {
        let msg = Message::ConnectRequest { name: "OMX.TI.DUCATI1.VIDEO.H264D".to_string() };
        let bytes = msg.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn connect_request_rejects_bad_names() {
        let empty = Message::ConnectRequest { name: String::new() };
        assert_eq!(empty.encode().unwrap_err(), ProtocolError::EmptyName);

        let nul = Message::ConnectRequest { name: "a\0b".to_string() };
        assert_eq!(nul.encode().unwrap_err(), ProtocolError::NameContainsNul);

        let long = Message::ConnectRequest { name: "x".repeat(48) };
        assert_eq!(long.encode().unwrap_err(), ProtocolError::NameTooLong { len: 48, max: 47 });

        let longest = Message::ConnectRequest { name: "x".repeat(47) };
        assert!(longest.encode().is_ok());
    }

    #[test]
    fn connect_response_wire_layout() {
        let msg = Message::ConnectResponse(ConnectResponse { status: 0, addr: 42 });
        let bytes = msg.encode().unwrap();
        assert_eq!(&bytes[..], hex!("01000000 00000000 08000000 00000000 2a000000"));
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn short_connect_response_is_truncated() {
        let bytes = hex!("01000000 00000000 04000000 00000000");
        assert!(matches!(Message::decode(&bytes), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn declared_length_beyond_buffer_is_truncated() {
        let bytes = hex!("05000000 00000000 10000000 0102");
        assert_eq!(
            Message::decode(&bytes).unwrap_err(),
            ProtocolError::Truncated { expected: 28, actual: 14 }
        );
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let bytes = hex!("05000000 00000000 02000000 0102 ffff");
        assert_eq!(Message::decode(&bytes).unwrap(), Message::Raw(Bytes::from_static(&[1, 2])));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let bytes = hex!("09000000 00000000 00000000");
        assert_eq!(Message::decode(&bytes).unwrap_err(), ProtocolError::UnknownType(9));
    }

    #[test]
    fn disconnect_carries_address() {
        let msg = Message::Disconnect { addr: 0x400 };
        let bytes = msg.encode().unwrap();
        assert_eq!(&bytes[..], hex!("04000000 00000000 04000000 00040000"));
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn raw_frame_prefixes_header() {
        let frame = Message::raw_frame(b"hello").unwrap();
        assert_eq!(&frame[..12], hex!("05000000 00000000 05000000"));
        assert_eq!(&frame[12..], b"hello");
    }

    #[test]
    fn length_field_overflow_is_rejected() {
        assert_eq!(wire_len(u32::MAX as usize), Ok(u32::MAX));

        #[cfg(target_pointer_width = "64")]
        {
            let len = u32::MAX as usize + 1;
            assert_eq!(wire_len(len), Err(ProtocolError::PayloadTooLarge { len }));
        }
    }
}
