//! Packet registry and frame protocol.
//!
//! A frame is `[packet id][payload]`. The id is one byte, or two
//! little-endian bytes when the registry is built in wide-id mode. Each
//! concrete packet type declares a [`PacketInfo`] and is registered once at
//! startup; the registry then decodes frames into boxed trait objects and
//! encodes them back.

use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use tracing::warn;

use crate::{codec::ByteStream, error::PacketError};

bitflags::bitflags! {
    /// Directions a packet may travel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Directions: u8 {
        const TO_SERVER = 1 << 0;
        const TO_CLIENT = 1 << 1;
        const BOTH = Self::TO_SERVER.bits() | Self::TO_CLIENT.bits();
    }
}

/// Dispatch urgency of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Urgency {
    /// Queued and handled on the next tick.
    #[default]
    Normal,
    /// Handled inline, as soon as the message arrives.
    Immediate,
}

/// Static descriptor of a packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketInfo {
    pub id: u16,
    pub directions: Directions,
    pub urgency: Urgency,
}

impl PacketInfo {
    pub const fn new(id: u16, directions: Directions) -> Self {
        Self {
            id,
            directions,
            urgency: Urgency::Normal,
        }
    }

    pub const fn immediate(mut self) -> Self {
        self.urgency = Urgency::Immediate;
        self
    }
}

/// Payload (de)serialization shared by every packet.
pub trait Packet: Any + Debug + Send + Sync {
    /// Consumes this packet's payload from `input`.
    fn read_data(&mut self, input: &mut ByteStream) -> Result<(), PacketError>;

    /// Appends this packet's payload to `out`.
    fn write_data(&self, out: &mut ByteStream) -> Result<(), PacketError>;

    /// Type name used in logs and errors.
    fn packet_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// A concrete, registrable packet type.
///
/// Types that leave `INFO` as `None` are rejected at registration.
pub trait PacketKind: Packet + Default {
    const INFO: Option<PacketInfo> = None;
}

impl dyn Packet {
    pub fn is<T: Packet>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Packet>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Takes ownership of the concrete packet. Check with [`is`](Self::is)
    /// first when the box must survive a mismatch.
    pub fn downcast<T: Packet>(self: Box<Self>) -> Option<Box<T>> {
        self.into_any().downcast::<T>().ok()
    }
}

/// Implements the naming and `Any` plumbing of [`Packet`] for a concrete type.
#[macro_export]
macro_rules! packet_any {
    () => {
        fn packet_name(&self) -> &'static str {
            ::std::any::type_name::<Self>()
        }

        fn as_any(&self) -> &dyn ::std::any::Any {
            self
        }

        fn into_any(self: Box<Self>) -> Box<dyn ::std::any::Any> {
            self
        }
    };
}

type PacketFactory = fn() -> Box<dyn Packet>;

struct Registration {
    info: PacketInfo,
    name: &'static str,
    create: PacketFactory,
}

fn create<T: PacketKind>() -> Box<dyn Packet> {
    Box::new(T::default())
}

/// Bidirectional packet type <-> id map with byte accounting.
pub struct PacketRegistry {
    wide_ids: bool,
    by_id: HashMap<u16, Registration>,
    by_type: HashMap<TypeId, u16>,
    received_bytes: AtomicU64,
    sent_bytes: AtomicU64,
}

impl PacketRegistry {
    pub fn new(wide_ids: bool) -> Self {
        Self {
            wide_ids,
            by_id: HashMap::new(),
            by_type: HashMap::new(),
            received_bytes: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
        }
    }

    pub fn wide_ids(&self) -> bool {
        self.wide_ids
    }

    /// Registers `T` under its declared id.
    pub fn register<T: PacketKind>(&mut self) -> Result<PacketInfo, PacketError> {
        let name = type_name::<T>();
        let info = T::INFO.ok_or(PacketError::NotDecorated(name))?;

        if self.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(PacketError::DuplicateType(name));
        }
        if !self.wide_ids && info.id > u16::from(u8::MAX) {
            return Err(PacketError::IdOutOfRange {
                id: info.id,
                bits: 8,
            });
        }
        if self.by_id.contains_key(&info.id) {
            return Err(PacketError::DuplicateId(info.id));
        }

        self.by_id.insert(
            info.id,
            Registration {
                info,
                name,
                create: create::<T>,
            },
        );
        self.by_type.insert(TypeId::of::<T>(), info.id);
        Ok(info)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn is_registered(&self, id: u16) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn id_of<T: Packet>(&self) -> Option<u16> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn info(&self, id: u16) -> Option<PacketInfo> {
        self.by_id.get(&id).map(|r| r.info)
    }

    pub fn name(&self, id: u16) -> Option<&'static str> {
        self.by_id.get(&id).map(|r| r.name)
    }

    /// Descriptor of an already-built packet.
    pub fn descriptor_of(&self, packet: &dyn Packet) -> Option<PacketInfo> {
        self.by_type
            .get(&packet.as_any().type_id())
            .and_then(|id| self.info(*id))
    }

    /// Instantiates an empty packet for `id`.
    pub fn create(&self, id: u16) -> Option<Box<dyn Packet>> {
        self.by_id.get(&id).map(|r| (r.create)())
    }

    /// Decodes one frame travelling in `direction`.
    pub fn decode(
        &self,
        frame: &[u8],
        direction: Directions,
    ) -> Result<(Box<dyn Packet>, PacketInfo), PacketError> {
        let mut input = ByteStream::from_slice(frame);
        let id = if self.wide_ids {
            input.read_u16()?
        } else {
            u16::from(input.read_u8()?)
        };

        let reg = self.by_id.get(&id).ok_or(PacketError::BadPacketId(id))?;
        if !reg.info.directions.intersects(direction) {
            return Err(PacketError::BadPacketId(id));
        }

        let mut packet = (reg.create)();
        packet.read_data(&mut input)?;

        self.received_bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok((packet, reg.info))
    }

    /// Like [`decode`](Self::decode), but logs and drops faulty frames.
    pub fn decode_or_drop(&self, frame: &[u8], direction: Directions) -> Option<Box<dyn Packet>> {
        match self.decode(frame, direction) {
            Ok((packet, _)) => Some(packet),
            Err(e) => {
                warn!(error = %e, len = frame.len(), "Dropping malformed frame");
                None
            }
        }
    }

    /// Encodes `packet` as one frame.
    pub fn encode(&self, packet: &dyn Packet) -> Result<Bytes, PacketError> {
        let id = *self
            .by_type
            .get(&packet.as_any().type_id())
            .ok_or_else(|| PacketError::UnknownPacket(packet.packet_name()))?;

        let mut out = ByteStream::with_capacity(32);
        if self.wide_ids {
            out.write_u16(id);
        } else {
            let narrow = u8::try_from(id).map_err(|_| PacketError::IdOutOfRange { id, bits: 8 })?;
            out.write_u8(narrow);
        }
        packet.write_data(&mut out)?;

        self.sent_bytes
            .fetch_add(out.size() as u64, Ordering::Relaxed);
        Ok(out.into_bytes())
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn reset_byte_counters(&self) {
        self.received_bytes.store(0, Ordering::Relaxed);
        self.sent_bytes.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::MAX_STRING_LEN, packet_any};

    #[derive(Debug, Default, PartialEq)]
    struct Ping {
        nonce: u32,
    }

    impl Packet for Ping {
        fn read_data(&mut self, input: &mut ByteStream) -> Result<(), PacketError> {
            self.nonce = input.read_u32()?;
            Ok(())
        }

        fn write_data(&self, out: &mut ByteStream) -> Result<(), PacketError> {
            out.write_u32(self.nonce);
            Ok(())
        }

        packet_any!();
    }

    impl PacketKind for Ping {
        const INFO: Option<PacketInfo> = Some(PacketInfo::new(10, Directions::BOTH));
    }

    #[derive(Debug, Default, PartialEq)]
    struct Pong;

    impl Packet for Pong {
        fn read_data(&mut self, _input: &mut ByteStream) -> Result<(), PacketError> {
            Ok(())
        }

        fn write_data(&self, _out: &mut ByteStream) -> Result<(), PacketError> {
            Ok(())
        }

        packet_any!();
    }

    impl PacketKind for Pong {
        const INFO: Option<PacketInfo> = Some(PacketInfo::new(10, Directions::TO_CLIENT));
    }

    #[derive(Debug, Default)]
    struct Undecorated;

    impl Packet for Undecorated {
        fn read_data(&mut self, _input: &mut ByteStream) -> Result<(), PacketError> {
            Ok(())
        }

        fn write_data(&self, _out: &mut ByteStream) -> Result<(), PacketError> {
            Ok(())
        }

        packet_any!();
    }

    impl PacketKind for Undecorated {}

    #[derive(Debug, Default)]
    struct Shout {
        text: String,
    }

    impl Packet for Shout {
        fn read_data(&mut self, input: &mut ByteStream) -> Result<(), PacketError> {
            self.text = input.read_string(MAX_STRING_LEN)?;
            Ok(())
        }

        fn write_data(&self, out: &mut ByteStream) -> Result<(), PacketError> {
            out.write_string(&self.text)?;
            Ok(())
        }

        packet_any!();
    }

    impl PacketKind for Shout {
        const INFO: Option<PacketInfo> =
            Some(PacketInfo::new(300, Directions::TO_SERVER).immediate());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut reg = PacketRegistry::new(false);
        reg.register::<Ping>().unwrap();
        assert_eq!(reg.register::<Pong>(), Err(PacketError::DuplicateId(10)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_type_is_rejected() {
        let mut reg = PacketRegistry::new(false);
        reg.register::<Ping>().unwrap();
        assert!(matches!(
            reg.register::<Ping>(),
            Err(PacketError::DuplicateType(_))
        ));
    }

    #[test]
    fn undecorated_type_is_rejected() {
        let mut reg = PacketRegistry::new(false);
        assert!(matches!(
            reg.register::<Undecorated>(),
            Err(PacketError::NotDecorated(_))
        ));
    }

    #[test]
    fn wide_ids_only_in_wide_mode() {
        let mut narrow = PacketRegistry::new(false);
        assert_eq!(
            narrow.register::<Shout>(),
            Err(PacketError::IdOutOfRange { id: 300, bits: 8 })
        );

        let mut wide = PacketRegistry::new(true);
        wide.register::<Shout>().unwrap();
        let frame = wide
            .encode(&Shout {
                text: "hey".into(),
            })
            .unwrap();
        assert_eq!(&frame[..2], &300u16.to_le_bytes());

        let (packet, info) = wide.decode(&frame, Directions::TO_SERVER).unwrap();
        assert_eq!(info.urgency, Urgency::Immediate);
        assert_eq!(packet.downcast_ref::<Shout>().unwrap().text, "hey");
    }

    #[test]
    fn decode_checks_id_and_direction() {
        let mut reg = PacketRegistry::new(false);
        reg.register::<Ping>().unwrap();

        assert_eq!(
            reg.decode(&[99], Directions::TO_SERVER).unwrap_err(),
            PacketError::BadPacketId(99)
        );
        assert!(matches!(
            reg.decode(&[], Directions::TO_SERVER).unwrap_err(),
            PacketError::Codec(_)
        ));

        let mut only_client = PacketRegistry::new(false);
        only_client.register::<Pong>().unwrap();
        assert_eq!(
            only_client.decode(&[10], Directions::TO_SERVER).unwrap_err(),
            PacketError::BadPacketId(10)
        );
        assert!(only_client.decode(&[10], Directions::TO_CLIENT).is_ok());
    }

    #[test]
    fn truncated_payload_is_dropped() {
        let mut reg = PacketRegistry::new(false);
        reg.register::<Ping>().unwrap();
        assert!(reg.decode_or_drop(&[10, 1, 2], Directions::TO_SERVER).is_none());
        assert_eq!(reg.received_bytes(), 0);
    }

    #[test]
    fn encode_unregistered_fails() {
        let reg = PacketRegistry::new(false);
        assert!(matches!(
            reg.encode(&Ping { nonce: 1 }),
            Err(PacketError::UnknownPacket(_))
        ));
    }

    #[test]
    fn byte_accounting() {
        let mut reg = PacketRegistry::new(false);
        reg.register::<Ping>().unwrap();

        let frame = reg.encode(&Ping { nonce: 42 }).unwrap();
        assert_eq!(frame.len(), 5);
        assert_eq!(reg.sent_bytes(), 5);

        let (packet, _) = reg.decode(&frame, Directions::TO_SERVER).unwrap();
        assert_eq!(packet.downcast::<Ping>().unwrap().nonce, 42);
        assert_eq!(reg.received_bytes(), 5);

        reg.reset_byte_counters();
        assert_eq!((reg.sent_bytes(), reg.received_bytes()), (0, 0));
    }
}
