use byteorder::{BigEndian, ByteOrder};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Fixed packet framing overhead: STX(1) + length(4) + flags(1) + source(2) + dest(2) + ETX(1).
pub const HEADER_SIZE: usize = 10;
pub const FRAMING_OVERHEAD: usize = HEADER_SIZE + 1;
pub const CRC_SIZE: usize = 4;

/// Largest value the parser will accept in a packet's wire **total-length** field
/// (`FRAMING_OVERHEAD + payload + optional CRC`, not the payload alone) before
/// resetting (`length > 1_000_000` rejects).
pub const MAX_TOTAL_LENGTH: u32 = 1_000_000;

pub const BROADCAST_ADDRESS: u16 = 0x0000;
pub const MASTER_ADDRESS: u16 = 0x0001;
pub const ROUTER_POLL_ADDRESS: u16 = 0xFFFE;
pub const UNASSIGNED_ADDRESS: u16 = 0xFFFF;

bitflags::bitflags! {
    /// Packet framing flags. `RAW` is reserved by the wire format but carries no
    /// behavior in the core (no payload class currently interprets it).
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct Flags: u8 {
        const NONE = 0;
        const CRC = 0x01;
        const RAW = 0x02;
    }
}

/// A self-framed, big-endian packet buffer. Packets are value types: cloning copies
/// the underlying bytes, which is cheap at the sizes this protocol moves (bounded to
/// [`MAX_TOTAL_LENGTH`]) and keeps ownership unambiguous as a packet is handed from a
/// node up through its router and out over an adaptor.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    data: Vec<u8>,
    write_index: usize,
    read_index: usize,
    sealed: bool,
}

impl Packet {
    /// Allocates a new packet with `payload_len` bytes reserved for the payload and
    /// writes the header immediately. The payload and trailer are filled in by the
    /// caller via [`Packet::write`] / [`Packet::write_bytes`], then [`Packet::seal`].
    pub fn new(payload_len: u32, flags: Flags, source: u16, destination: u16) -> Packet {
        let mut total = HEADER_SIZE + 1 + payload_len as usize;
        if flags.contains(Flags::CRC) {
            total += CRC_SIZE;
        }

        let mut packet = Packet {
            data: vec![0u8; total],
            write_index: 0,
            read_index: 0,
            sealed: false,
        };

        packet.write(STX);
        packet.write(total as u32);
        packet.write(flags.bits());
        packet.write(source);
        packet.write(destination);

        packet
    }

    /// Appends the ETX trailer and, if `Flags::CRC` was requested, the CRC-32/ISO-HDLC
    /// checksum over `[STX..ETX]` inclusive. After this the packet is immutable.
    pub fn seal(&mut self) {
        if self.sealed {
            return;
        }

        self.write(ETX);

        if self.flags().contains(Flags::CRC) {
            let crc_end = self.write_index;
            let crc = crc32fast::hash(&self.data[..crc_end]);
            self.write(crc);
        }

        self.sealed = true;
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Bytes written so far. Used by the parser to know where the CRC it is
    /// validating ends, before that CRC itself has been written into the buffer.
    #[inline]
    pub(crate) fn written_len(&self) -> usize {
        self.write_index
    }

    /// Marks a packet assembled directly from wire bytes (by the parser) as sealed,
    /// without re-deriving its trailer the way [`Packet::seal`] does for a packet
    /// built up field by field on the sending side.
    #[inline]
    pub(crate) fn mark_sealed(&mut self) {
        self.sealed = true;
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn length(&self) -> u32 {
        BigEndian::read_u32(&self.data[1..5])
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.data[5])
    }

    #[inline]
    pub fn source(&self) -> u16 {
        BigEndian::read_u16(&self.data[6..8])
    }

    #[inline]
    pub fn destination(&self) -> u16 {
        BigEndian::read_u16(&self.data[8..10])
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        let end = self.data.len() - 1 - if self.flags().contains(Flags::CRC) { CRC_SIZE } else { 0 };
        &self.data[HEADER_SIZE..end]
    }

    #[inline]
    pub fn payload_len(&self) -> u32 {
        self.payload().len() as u32
    }

    #[inline]
    pub fn reset_read(&mut self) {
        self.read_index = 0;
    }

    #[inline]
    pub fn reset_read_to_payload(&mut self) {
        self.read_index = HEADER_SIZE;
    }

    /// Remaining unwritten slice of the buffer, used by the parser to read payload
    /// bytes straight off the stream without an intermediate copy.
    #[inline]
    pub(crate) fn write_remainder_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write_index..]
    }

    #[inline]
    pub(crate) fn advance_write(&mut self, count: usize) {
        self.write_index += count;
    }

    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.sealed {
            return;
        }
        let end = self.write_index + bytes.len();
        self.data[self.write_index..end].copy_from_slice(bytes);
        self.write_index = end;
    }

    #[inline]
    pub fn write<T: WireScalar>(&mut self, value: T) {
        if self.sealed {
            return;
        }
        value.write_be(&mut self.data[self.write_index..self.write_index + T::SIZE]);
        self.write_index += T::SIZE;
    }

    #[inline]
    pub fn read<T: WireScalar>(&mut self) -> T {
        let value = T::read_be(&self.data[self.read_index..self.read_index + T::SIZE]);
        self.read_index += T::SIZE;
        value
    }

    #[inline]
    pub fn read_bytes(&mut self, len: usize) -> &[u8] {
        let start = self.read_index;
        self.read_index += len;
        &self.data[start..self.read_index]
    }
}

/// Big-endian wire encoding for the scalar types the protocol puts on the wire.
/// Kept as a sealed trait so `Packet::read`/`Packet::write` stay generic the way the
/// original's templated `Read<T>()`/`Write<T>()` did.
pub trait WireScalar: Copy {
    const SIZE: usize;
    fn write_be(self, out: &mut [u8]);
    fn read_be(input: &[u8]) -> Self;
}

impl WireScalar for u8 {
    const SIZE: usize = 1;
    fn write_be(self, out: &mut [u8]) {
        out[0] = self;
    }
    fn read_be(input: &[u8]) -> Self {
        input[0]
    }
}

impl WireScalar for bool {
    const SIZE: usize = 1;
    fn write_be(self, out: &mut [u8]) {
        out[0] = self as u8;
    }
    fn read_be(input: &[u8]) -> Self {
        input[0] != 0
    }
}

impl WireScalar for u16 {
    const SIZE: usize = 2;
    fn write_be(self, out: &mut [u8]) {
        BigEndian::write_u16(out, self);
    }
    fn read_be(input: &[u8]) -> Self {
        BigEndian::read_u16(input)
    }
}

impl WireScalar for u32 {
    const SIZE: usize = 4;
    fn write_be(self, out: &mut [u8]) {
        BigEndian::write_u32(out, self);
    }
    fn read_be(input: &[u8]) -> Self {
        BigEndian::read_u32(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_packet_round_trip() {
        let mut packet = Packet::new(1, Flags::NONE, 0, 0);
        packet.write_bytes(&[0xAA]);
        packet.seal();

        assert_eq!(packet.length(), 12);
        assert_eq!(packet.data()[packet.data().len() - 1], ETX);
        assert_eq!(packet.payload(), &[0xAA]);
    }

    #[test]
    fn crc_flag_appends_four_bytes() {
        let mut packet = Packet::new(2, Flags::CRC, 5, 9);
        packet.write_bytes(&[1, 2]);
        packet.seal();

        assert_eq!(packet.length() as usize, packet.data().len());
        assert_eq!(packet.length(), (HEADER_SIZE + 1 + 2 + CRC_SIZE) as u32);
        assert_eq!(packet.payload(), &[1, 2]);
    }

    #[test]
    fn writes_after_seal_are_ignored() {
        let mut packet = Packet::new(1, Flags::NONE, 0, 0);
        packet.write_bytes(&[1]);
        packet.seal();
        let before = packet.data().to_vec();

        packet.write_bytes(&[2]);
        packet.write(42u16);

        assert_eq!(packet.data(), &before[..]);
    }

    #[test]
    fn read_cursor_resets_independently_of_write_cursor() {
        let mut packet = Packet::new(4, Flags::NONE, 1, 2);
        packet.write_bytes(&[1, 2, 3, 4]);
        packet.seal();

        packet.reset_read_to_payload();
        assert_eq!(packet.read::<u8>(), 1);
        assert_eq!(packet.read::<u8>(), 2);

        packet.reset_read();
        assert_eq!(packet.read::<u8>(), STX);
    }
}
