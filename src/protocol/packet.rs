use std::convert::TryInto;

use super::{
    ProtocolError, Status, MAGIC_REQUEST, MAGIC_RESPONSE, OP_ADD, OP_ADDQ, OP_APPEND, OP_APPENDQ,
    OP_DECREMENT, OP_DECREMENTQ, OP_DELETE, OP_DELETEQ, OP_FLUSH, OP_GAT, OP_GET, OP_GETK,
    OP_GETKQ, OP_GETQ, OP_INCREMENT, OP_INCREMENTQ, OP_NOOP, OP_PREPEND, OP_PREPENDQ, OP_REPLACE,
    OP_REPLACEQ, OP_SASL_AUTH, OP_SASL_LIST, OP_SET, OP_SETQ, OP_STAT, OP_TOUCH, OP_VERSION,
};

/// A connection-scoped request/response correlator. Assigned monotonically
/// per connection, wrapping modulo 2^32 and skipping zero.
pub type Opaque = u32;

/// The fixed 24-byte header that precedes every request and response.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub vbucket_or_status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    pub const SIZE: usize = 24;

    pub fn read_response(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::PacketTooSmall);
        }
        let magic = u8::from_be_bytes(bytes[0..1].try_into().unwrap());
        if magic != MAGIC_RESPONSE {
            return Err(ProtocolError::InvalidMagic(magic));
        }
        Ok(Header {
            magic,
            opcode: u8::from_be_bytes(bytes[1..2].try_into().unwrap()),
            key_length: u16::from_be_bytes(bytes[2..4].try_into().unwrap()),
            extras_length: u8::from_be_bytes(bytes[4..5].try_into().unwrap()),
            data_type: u8::from_be_bytes(bytes[5..6].try_into().unwrap()),
            vbucket_or_status: u16::from_be_bytes(bytes[6..8].try_into().unwrap()),
            body_len: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            opaque: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            cas: u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
        })
    }

    pub fn to_bytes(self) -> [u8; Header::SIZE] {
        let mut out = [0u8; Header::SIZE];
        out[0..1].copy_from_slice(&self.magic.to_be_bytes());
        out[1..2].copy_from_slice(&self.opcode.to_be_bytes());
        out[2..4].copy_from_slice(&self.key_length.to_be_bytes());
        out[4..5].copy_from_slice(&self.extras_length.to_be_bytes());
        out[5..6].copy_from_slice(&self.data_type.to_be_bytes());
        out[6..8].copy_from_slice(&self.vbucket_or_status.to_be_bytes());
        out[8..12].copy_from_slice(&self.body_len.to_be_bytes());
        out[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        out[16..24].copy_from_slice(&self.cas.to_be_bytes());
        out
    }

    pub fn read_packet(self, body: &[u8]) -> Result<Packet, ProtocolError> {
        if body.len() != self.body_len as usize {
            return Err(ProtocolError::BodySizeMismatch);
        }
        let (extras, body) = body.split_at(self.extras_length as usize);
        let (key, value) = body.split_at(self.key_length as usize);
        Ok(Packet {
            header: self,
            extras: extras.into(),
            key: key.into(),
            value: value.into(),
        })
    }
}

/// Extras for SET/ADD/REPLACE requests: the caller's opaque flags word and
/// the expiry in seconds (or a unix timestamp past 30 days, per protocol).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SetExtras {
    pub flags: u32,
    pub expire: u32,
}

impl SetExtras {
    pub fn new(flags: u32, expire: u32) -> Self {
        Self { flags, expire }
    }

    fn to_bytes(self) -> Vec<u8> {
        [self.flags.to_be_bytes(), self.expire.to_be_bytes()].concat()
    }
}

/// Extras for INCREMENT/DECREMENT: the delta to apply, the initial value to
/// seed the counter with if it is absent, and an expiry. `initial_expire`
/// of `0xFFFFFFFF` means "fail if the key is absent" instead of seeding it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IncrDecrExtras {
    pub delta: u64,
    pub initial: u64,
    pub expire: u32,
}

impl IncrDecrExtras {
    pub const FAIL_IF_ABSENT: u32 = 0xFFFF_FFFF;

    pub fn new(delta: u64, initial: u64, expire: u32) -> Self {
        Self {
            delta,
            initial,
            expire,
        }
    }

    fn to_bytes(self) -> Vec<u8> {
        [
            &self.delta.to_be_bytes()[..],
            &self.initial.to_be_bytes()[..],
            &self.expire.to_be_bytes()[..],
        ]
        .concat()
    }
}

/// Extras for TOUCH/GAT: the new expiry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TouchExtras {
    pub expire: u32,
}

impl TouchExtras {
    pub fn new(expire: u32) -> Self {
        Self { expire }
    }

    fn to_bytes(self) -> Vec<u8> {
        self.expire.to_be_bytes().to_vec()
    }
}

/// Extras for FLUSH: an optional staggered delay in seconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushExtras {
    pub delay: u32,
}

impl FlushExtras {
    fn to_bytes(self) -> Vec<u8> {
        self.delay.to_be_bytes().to_vec()
    }
}

/// A request or response frame: header plus its three variable-length
/// sections. `value` already carries whatever the [value codec](crate::value)
/// produced; this layer only knows about bytes.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Packet {
    pub header: Header,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Packet {
    fn new_request(opcode: u8, key: &[u8], extras: Vec<u8>, value: Vec<u8>, opaque: Opaque) -> Self {
        let mut header = Header {
            magic: MAGIC_REQUEST,
            opcode,
            key_length: key.len() as u16,
            extras_length: extras.len() as u8,
            opaque,
            ..Default::default()
        };
        header.body_len = (extras.len() + key.len() + value.len()) as u32;
        Packet {
            header,
            extras,
            key: key.to_vec(),
            value,
        }
    }

    fn new_cas_request(
        opcode: u8,
        key: &[u8],
        extras: Vec<u8>,
        value: Vec<u8>,
        cas: u64,
        opaque: Opaque,
    ) -> Self {
        let mut packet = Self::new_request(opcode, key, extras, value, opaque);
        packet.header.cas = cas;
        packet
    }

    pub fn get(key: &[u8], opaque: Opaque) -> Self {
        Self::new_request(OP_GET, key, vec![], vec![], opaque)
    }

    pub fn getk(key: &[u8], opaque: Opaque) -> Self {
        Self::new_request(OP_GETK, key, vec![], vec![], opaque)
    }

    pub fn getq(key: &[u8], opaque: Opaque) -> Self {
        Self::new_request(OP_GETQ, key, vec![], vec![], opaque)
    }

    pub fn getkq(key: &[u8], opaque: Opaque) -> Self {
        Self::new_request(OP_GETKQ, key, vec![], vec![], opaque)
    }

    #[allow(clippy::too_many_arguments)]
    fn store(
        opcode: u8,
        key: &[u8],
        value: Vec<u8>,
        extras: SetExtras,
        cas: u64,
        opaque: Opaque,
    ) -> Self {
        Self::new_cas_request(opcode, key, extras.to_bytes(), value, cas, opaque)
    }

    pub fn set(key: &[u8], value: Vec<u8>, extras: SetExtras, cas: u64, opaque: Opaque) -> Self {
        Self::store(OP_SET, key, value, extras, cas, opaque)
    }

    pub fn setq(key: &[u8], value: Vec<u8>, extras: SetExtras, cas: u64, opaque: Opaque) -> Self {
        Self::store(OP_SETQ, key, value, extras, cas, opaque)
    }

    pub fn add(key: &[u8], value: Vec<u8>, extras: SetExtras, opaque: Opaque) -> Self {
        Self::store(OP_ADD, key, value, extras, 0, opaque)
    }

    pub fn addq(key: &[u8], value: Vec<u8>, extras: SetExtras, opaque: Opaque) -> Self {
        Self::store(OP_ADDQ, key, value, extras, 0, opaque)
    }

    pub fn replace(key: &[u8], value: Vec<u8>, extras: SetExtras, cas: u64, opaque: Opaque) -> Self {
        Self::store(OP_REPLACE, key, value, extras, cas, opaque)
    }

    pub fn replaceq(key: &[u8], value: Vec<u8>, extras: SetExtras, cas: u64, opaque: Opaque) -> Self {
        Self::store(OP_REPLACEQ, key, value, extras, cas, opaque)
    }

    pub fn append(key: &[u8], value: Vec<u8>, cas: u64, opaque: Opaque) -> Self {
        Self::new_cas_request(OP_APPEND, key, vec![], value, cas, opaque)
    }

    pub fn appendq(key: &[u8], value: Vec<u8>, cas: u64, opaque: Opaque) -> Self {
        Self::new_cas_request(OP_APPENDQ, key, vec![], value, cas, opaque)
    }

    pub fn prepend(key: &[u8], value: Vec<u8>, cas: u64, opaque: Opaque) -> Self {
        Self::new_cas_request(OP_PREPEND, key, vec![], value, cas, opaque)
    }

    pub fn prependq(key: &[u8], value: Vec<u8>, cas: u64, opaque: Opaque) -> Self {
        Self::new_cas_request(OP_PREPENDQ, key, vec![], value, cas, opaque)
    }

    pub fn delete(key: &[u8], opaque: Opaque) -> Self {
        Self::new_request(OP_DELETE, key, vec![], vec![], opaque)
    }

    pub fn deleteq(key: &[u8], opaque: Opaque) -> Self {
        Self::new_request(OP_DELETEQ, key, vec![], vec![], opaque)
    }

    pub fn incr(key: &[u8], extras: IncrDecrExtras, opaque: Opaque) -> Self {
        Self::new_request(OP_INCREMENT, key, extras.to_bytes(), vec![], opaque)
    }

    pub fn incrq(key: &[u8], extras: IncrDecrExtras, opaque: Opaque) -> Self {
        Self::new_request(OP_INCREMENTQ, key, extras.to_bytes(), vec![], opaque)
    }

    pub fn decr(key: &[u8], extras: IncrDecrExtras, opaque: Opaque) -> Self {
        Self::new_request(OP_DECREMENT, key, extras.to_bytes(), vec![], opaque)
    }

    pub fn decrq(key: &[u8], extras: IncrDecrExtras, opaque: Opaque) -> Self {
        Self::new_request(OP_DECREMENTQ, key, extras.to_bytes(), vec![], opaque)
    }

    pub fn touch(key: &[u8], extras: TouchExtras, opaque: Opaque) -> Self {
        Self::new_request(OP_TOUCH, key, extras.to_bytes(), vec![], opaque)
    }

    pub fn gat(key: &[u8], extras: TouchExtras, opaque: Opaque) -> Self {
        Self::new_request(OP_GAT, key, extras.to_bytes(), vec![], opaque)
    }

    pub fn noop(opaque: Opaque) -> Self {
        Self::new_request(OP_NOOP, b"", vec![], vec![], opaque)
    }

    pub fn version(opaque: Opaque) -> Self {
        Self::new_request(OP_VERSION, b"", vec![], vec![], opaque)
    }

    pub fn stat(key: Option<&[u8]>, opaque: Opaque) -> Self {
        Self::new_request(OP_STAT, key.unwrap_or(b""), vec![], vec![], opaque)
    }

    pub fn flush(opaque: Opaque) -> Self {
        Self::new_request(OP_FLUSH, b"", vec![], vec![], opaque)
    }

    pub fn flush_with_delay(extras: FlushExtras, opaque: Opaque) -> Self {
        Self::new_request(OP_FLUSH, b"", extras.to_bytes(), vec![], opaque)
    }

    pub fn sasl_list(opaque: Opaque) -> Self {
        Self::new_request(OP_SASL_LIST, b"", vec![], vec![], opaque)
    }

    pub fn sasl_auth(mechanism: &[u8], data: Vec<u8>, opaque: Opaque) -> Self {
        Self::new_request(OP_SASL_AUTH, mechanism, vec![], data, opaque)
    }

    /// The flags word carried in a GET response's extras, if any.
    pub fn response_flags(&self) -> u32 {
        if self.extras.len() < 4 {
            return 0;
        }
        u32::from_be_bytes(self.extras[0..4].try_into().unwrap())
    }

    /// The new counter value carried in an INCR/DECR response's value.
    pub fn counter_value(&self) -> Result<u64, ProtocolError> {
        if self.value.len() != 8 {
            return Err(ProtocolError::BodySizeMismatch);
        }
        Ok(u64::from_be_bytes(self.value[0..8].try_into().unwrap()))
    }

    pub fn error_for_status(&self) -> Result<(), Status> {
        match self.header.vbucket_or_status {
            0 => Ok(()),
            code => Err(Status::from(code)),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.header.opcode == OP_NOOP
    }
}

impl From<Packet> for Vec<u8> {
    fn from(p: Packet) -> Self {
        [&p.header.to_bytes()[..], &p.extras[..], &p.key[..], &p.value[..]].concat()
    }
}

#[cfg(test)]
mod tests {
    use super::{Header, IncrDecrExtras, Packet, SetExtras};

    #[test]
    fn get_request_has_no_body() {
        let packet = Packet::get(b"hello", 7);
        assert_eq!(0x80, packet.header.magic);
        assert_eq!(0, packet.header.extras_length);
        assert_eq!(5, packet.header.key_length);
        assert_eq!(5, packet.header.body_len);
        assert_eq!(7, packet.header.opaque);
    }

    #[test]
    fn set_request_carries_flags_and_expiry_in_extras() {
        let packet = Packet::set(b"Hello", b"World".to_vec(), SetExtras::new(0xdeadbeef, 0x1c20), 0, 0);
        let expect_bytes = vec![
            0x80, 0x01, 0x00, 0x05, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef,
            0x00, 0x00, 0x1c, 0x20, 0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x57, 0x6f, 0x72, 0x6c, 0x64,
        ];
        let packet_bytes: Vec<u8> = packet.into();
        assert_eq!(expect_bytes, packet_bytes);
    }

    #[test]
    fn incr_extras_encode_big_endian() {
        let extras = IncrDecrExtras::new(1, 0, IncrDecrExtras::FAIL_IF_ABSENT);
        let packet = Packet::incr(b"ctr", extras, 1);
        assert_eq!(20, packet.header.extras_length);
        assert_eq!(
            vec![
                0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF
            ],
            packet.extras
        );
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let header = Header {
            magic: 0x80,
            opcode: 0x0,
            key_length: 5,
            extras_length: 0,
            data_type: 0,
            vbucket_or_status: 0,
            body_len: 5,
            opaque: 42,
            cas: 7,
        };
        let bytes = header.to_bytes();
        let mut response_bytes = bytes;
        response_bytes[0] = 0x81; // responses carry the response magic
        let parsed = Header::read_response(&response_bytes).unwrap();
        assert_eq!(0x81, parsed.magic);
        assert_eq!(header.opaque, parsed.opaque);
        assert_eq!(header.cas, parsed.cas);

        let packet = header.read_packet(b"Hello").unwrap();
        assert_eq!(b"Hello", &packet.key[..]);
    }
}
