//! Actor Message Envelope
//!
//! The unit of delivery between actors, in memory and on the wire. An
//! envelope is immutable once built: the fields are private and only the
//! creation-time builders can set them.
//!
//! ## Wire body
//!
//! ```text
//! u8    version
//! [16]  envelope_id
//! u8    sender present, then address when 1
//! ...   destination address
//! u8    kind
//! u8    deadline present, then u64 epoch millis when 1
//! u32   payload length, then payload bytes
//!
//! address := u16 len + endpoint | u16 len + pool_id | u16 len + actor_uid
//! ```
//!
//! All integers are big-endian. The body is length-prefixed by the frame
//! layer (see [`super::frame`]).

use super::ControlMessage;
use crate::{ActorAddress, ActorUid, EnvelopeId, PoolId, Result, TransportError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wire format constants
pub struct WireFormat;

impl WireFormat {
    /// Protocol version
    pub const VERSION: u8 = 1;
    /// Maximum frame body size (16MB)
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    /// Maximum length of each address component
    pub const MAX_STRING_LENGTH: usize = u16::MAX as usize;
    /// Length prefix size
    pub const LENGTH_PREFIX_SIZE: usize = 4;
}

/// Closed set of envelope kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// Fire-and-forget message
    Tell,
    /// Request expecting exactly one reply with the same envelope id
    Call,
    /// Create the destination actor
    CreateActor,
    /// Destroy the destination actor
    DestroyActor,
    /// Runtime control traffic (replies, cancellation, watches, keep-alive)
    Control,
}

impl EnvelopeKind {
    pub fn to_byte(self) -> u8 {
        match self {
            EnvelopeKind::Tell => 0,
            EnvelopeKind::Call => 1,
            EnvelopeKind::CreateActor => 2,
            EnvelopeKind::DestroyActor => 3,
            EnvelopeKind::Control => 4,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(EnvelopeKind::Tell),
            1 => Ok(EnvelopeKind::Call),
            2 => Ok(EnvelopeKind::CreateActor),
            3 => Ok(EnvelopeKind::DestroyActor),
            4 => Ok(EnvelopeKind::Control),
            other => Err(TransportError::protocol(format!(
                "Unknown envelope kind: {}",
                other
            ))),
        }
    }

    /// Kinds whose sender waits for a `Reply`
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            EnvelopeKind::Call | EnvelopeKind::CreateActor | EnvelopeKind::DestroyActor
        )
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Actor message envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    envelope_id: EnvelopeId,
    sender: Option<ActorAddress>,
    destination: ActorAddress,
    kind: EnvelopeKind,
    deadline_ms: Option<u64>,
    payload: Bytes,
}

impl Envelope {
    /// Create an envelope with a fresh id
    pub fn new(kind: EnvelopeKind, destination: ActorAddress, payload: impl Into<Bytes>) -> Self {
        Self {
            envelope_id: EnvelopeId::new(),
            sender: None,
            destination,
            kind,
            deadline_ms: None,
            payload: payload.into(),
        }
    }

    pub fn tell(destination: ActorAddress, payload: impl Into<Bytes>) -> Self {
        Self::new(EnvelopeKind::Tell, destination, payload)
    }

    pub fn call(destination: ActorAddress, payload: impl Into<Bytes>) -> Self {
        Self::new(EnvelopeKind::Call, destination, payload)
    }

    /// Build a control envelope correlated with `envelope_id`
    pub fn control(
        envelope_id: EnvelopeId,
        destination: ActorAddress,
        message: &ControlMessage,
    ) -> Result<Self> {
        Ok(Self::new(EnvelopeKind::Control, destination, message.encode()?).with_id(envelope_id))
    }

    pub fn with_id(mut self, envelope_id: EnvelopeId) -> Self {
        self.envelope_id = envelope_id;
        self
    }

    pub fn with_sender(mut self, sender: Option<ActorAddress>) -> Self {
        self.sender = sender;
        self
    }

    /// Absolute deadline in epoch milliseconds
    pub fn with_deadline_ms(mut self, deadline_ms: Option<u64>) -> Self {
        self.deadline_ms = deadline_ms;
        self
    }

    /// Deadline relative to now
    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        let deadline = timeout.map(|t| {
            let millis = u64::try_from(t.as_millis()).unwrap_or(u64::MAX);
            now_epoch_millis().saturating_add(millis)
        });
        self.with_deadline_ms(deadline)
    }

    pub fn id(&self) -> EnvelopeId {
        self.envelope_id
    }

    pub fn sender(&self) -> Option<&ActorAddress> {
        self.sender.as_ref()
    }

    pub fn destination(&self) -> &ActorAddress {
        &self.destination
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        self.deadline_ms
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Whether the deadline has passed at `now_ms`
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        matches!(self.deadline_ms, Some(deadline) if now_ms >= deadline)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_epoch_millis())
    }

    /// Decode the control message carried by a `Control` envelope
    pub fn control_message(&self) -> Result<ControlMessage> {
        if self.kind != EnvelopeKind::Control {
            return Err(TransportError::protocol(format!(
                "Envelope {} is {:?}, not Control",
                self.envelope_id, self.kind
            )));
        }
        ControlMessage::decode(&self.payload)
    }

    /// Encoded body size, excluding the length prefix
    pub fn encoded_len(&self) -> usize {
        let address_len = |a: &ActorAddress| {
            6 + a.endpoint().len() + a.pool_id().as_str().len() + a.uid().as_str().len()
        };
        1 + 16
            + 1
            + self.sender.as_ref().map(address_len).unwrap_or(0)
            + address_len(&self.destination)
            + 1
            + 1
            + self.deadline_ms.map(|_| 8).unwrap_or(0)
            + 4
            + self.payload.len()
    }

    /// Serialize envelope body to wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() > u32::MAX as usize {
            return Err(TransportError::protocol(format!(
                "Payload size {} exceeds u32 length field",
                self.payload.len()
            )));
        }

        let mut buffer = Vec::with_capacity(self.encoded_len());
        buffer.write_u8(WireFormat::VERSION)?;
        buffer.write_all(self.envelope_id.as_bytes())?;

        match &self.sender {
            Some(sender) => {
                buffer.write_u8(1)?;
                Self::write_address(&mut buffer, sender)?;
            }
            None => buffer.write_u8(0)?,
        }
        Self::write_address(&mut buffer, &self.destination)?;

        buffer.write_u8(self.kind.to_byte())?;

        match self.deadline_ms {
            Some(deadline) => {
                buffer.write_u8(1)?;
                buffer.write_u64::<BigEndian>(deadline)?;
            }
            None => buffer.write_u8(0)?,
        }

        buffer.write_u32::<BigEndian>(self.payload.len() as u32)?;
        buffer.write_all(&self.payload)?;

        Ok(buffer)
    }

    /// Deserialize envelope body from wire format
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let version = cursor.read_u8().map_err(truncated)?;
        if version != WireFormat::VERSION {
            return Err(TransportError::protocol(format!(
                "Unsupported protocol version: {}",
                version
            )));
        }

        let mut id = [0u8; 16];
        cursor.read_exact(&mut id).map_err(truncated)?;

        let sender = match cursor.read_u8().map_err(truncated)? {
            0 => None,
            1 => Some(Self::read_address(&mut cursor)?),
            other => {
                return Err(TransportError::protocol(format!(
                    "Invalid sender presence flag: {}",
                    other
                )))
            }
        };
        let destination = Self::read_address(&mut cursor)?;
        let kind = EnvelopeKind::from_byte(cursor.read_u8().map_err(truncated)?)?;

        let deadline_ms = match cursor.read_u8().map_err(truncated)? {
            0 => None,
            1 => Some(cursor.read_u64::<BigEndian>().map_err(truncated)?),
            other => {
                return Err(TransportError::protocol(format!(
                    "Invalid deadline presence flag: {}",
                    other
                )))
            }
        };

        let payload_len = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;
        let start = cursor.position() as usize;
        let remaining = data.len() - start;
        if payload_len != remaining {
            return Err(TransportError::protocol(format!(
                "Payload length {} does not match remaining body {}",
                payload_len, remaining
            )));
        }

        Ok(Self {
            envelope_id: EnvelopeId::from_bytes(id),
            sender,
            destination,
            kind,
            deadline_ms,
            payload: Bytes::copy_from_slice(&data[start..]),
        })
    }

    fn write_address(buffer: &mut Vec<u8>, address: &ActorAddress) -> Result<()> {
        Self::write_string(buffer, address.endpoint())?;
        Self::write_string(buffer, address.pool_id().as_str())?;
        Self::write_string(buffer, address.uid().as_str())
    }

    fn read_address(cursor: &mut Cursor<&[u8]>) -> Result<ActorAddress> {
        let endpoint = Self::read_string(cursor)?;
        let pool_id = Self::read_string(cursor)?;
        let uid = Self::read_string(cursor)?;
        Ok(ActorAddress::new(
            endpoint,
            PoolId::new(pool_id),
            ActorUid::new(uid),
        ))
    }

    /// Write length-prefixed string to buffer
    fn write_string(buffer: &mut Vec<u8>, s: &str) -> Result<()> {
        let bytes = s.as_bytes();
        if bytes.len() > WireFormat::MAX_STRING_LENGTH {
            return Err(TransportError::protocol(format!(
                "String too long: {} > {}",
                bytes.len(),
                WireFormat::MAX_STRING_LENGTH
            )));
        }
        buffer.write_u16::<BigEndian>(bytes.len() as u16)?;
        buffer.write_all(bytes)?;
        Ok(())
    }

    /// Read length-prefixed string from cursor
    fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
        let len = cursor.read_u16::<BigEndian>().map_err(truncated)? as usize;
        let mut bytes = vec![0u8; len];
        cursor.read_exact(&mut bytes).map_err(truncated)?;
        String::from_utf8(bytes)
            .map_err(|e| TransportError::protocol_with_source("Invalid UTF-8 in address", e))
    }
}

fn truncated(e: std::io::Error) -> TransportError {
    TransportError::protocol_with_source("Truncated envelope body", e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlMessage, ReplyError};

    fn address(endpoint: &str, pool: &str, uid: &str) -> ActorAddress {
        ActorAddress::new(endpoint, PoolId::new(pool), ActorUid::new(uid))
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope::call(address("10.0.0.2:7100", "main", "counter"), vec![5u8, 0, 0, 0])
            .with_sender(Some(address("10.0.0.1:7100", "main", "client")))
            .with_deadline_ms(Some(1_700_000_000_000));

        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(bytes.len(), envelope.encoded_len());

        let decoded = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.id(), envelope.id());
        assert_eq!(decoded.sender(), envelope.sender());
        assert_eq!(decoded.destination(), envelope.destination());
        assert_eq!(decoded.kind(), EnvelopeKind::Call);
        assert_eq!(decoded.deadline_ms(), Some(1_700_000_000_000));
        assert_eq!(decoded.payload(), envelope.payload());
    }

    #[test]
    fn test_body_layout_is_big_endian() {
        let envelope = Envelope::tell(address("e", "p", "u"), vec![0xAB])
            .with_deadline_ms(Some(0x0102_0304_0506_0708));
        let bytes = envelope.to_bytes().unwrap();

        assert_eq!(bytes[0], WireFormat::VERSION);
        assert_eq!(&bytes[1..17], envelope.id().as_bytes());
        assert_eq!(bytes[17], 0); // no sender
        assert_eq!(&bytes[18..21], &[0, 1, b'e']);
        // kind follows the three destination strings (3 bytes each)
        assert_eq!(bytes[27], EnvelopeKind::Tell.to_byte());
        assert_eq!(bytes[28], 1);
        assert_eq!(&bytes[29..37], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[37..41], &[0, 0, 0, 1]);
        assert_eq!(bytes[41], 0xAB);
    }

    #[test]
    fn test_control_envelope_keeps_correlation_id() {
        let call = Envelope::call(address("a:1", "p", "u"), Vec::new());
        let reply = Envelope::control(
            call.id(),
            address("b:1", "p", "caller"),
            &ControlMessage::Reply(Err(ReplyError::Timeout("late".into()))),
        )
        .unwrap();

        assert_eq!(reply.id(), call.id());
        let decoded = Envelope::from_bytes(&reply.to_bytes().unwrap()).unwrap();
        assert_eq!(
            decoded.control_message().unwrap(),
            ControlMessage::Reply(Err(ReplyError::Timeout("late".into())))
        );
    }

    #[test]
    fn test_rejects_unknown_version_and_kind() {
        let envelope = Envelope::tell(address("e", "p", "u"), Vec::new());
        let mut bytes = envelope.to_bytes().unwrap();
        bytes[0] = 9;
        assert!(Envelope::from_bytes(&bytes).is_err());

        let mut bytes = envelope.to_bytes().unwrap();
        bytes[27] = 42;
        assert!(Envelope::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_rejects_truncated_and_trailing_bytes() {
        let envelope = Envelope::tell(address("e", "p", "u"), vec![1, 2, 3]);
        let bytes = envelope.to_bytes().unwrap();

        for cut in 0..bytes.len() {
            assert!(Envelope::from_bytes(&bytes[..cut]).is_err(), "cut at {}", cut);
        }

        let mut extended = bytes.clone();
        extended.push(0);
        assert!(Envelope::from_bytes(&extended).is_err());
    }

    #[test]
    fn test_deadline_expiry() {
        let envelope = Envelope::call(address("e", "p", "u"), Vec::new()).with_deadline_ms(Some(1_000));
        assert!(!envelope.is_expired_at(999));
        assert!(envelope.is_expired_at(1_000));

        let open = Envelope::call(address("e", "p", "u"), Vec::new());
        assert!(!open.is_expired_at(u64::MAX));
    }

    #[test]
    fn test_huge_timeout_saturates_deadline() {
        let envelope = Envelope::call(address("e", "p", "u"), Vec::new()).with_timeout(Some(Duration::MAX));
        assert_eq!(envelope.deadline_ms(), Some(u64::MAX));
        assert!(!envelope.is_expired());
    }

    #[test]
    fn test_control_message_on_non_control_envelope() {
        let envelope = Envelope::tell(address("e", "p", "u"), Vec::new());
        assert!(envelope.control_message().is_err());
    }
}
