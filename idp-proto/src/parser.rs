use crate::packet::{Flags, Packet, ETX, FRAMING_OVERHEAD, HEADER_SIZE, MAX_TOTAL_LENGTH, STX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingForStx,
    ReadingLength,
    ReadingFlags,
    ReadingSource,
    ReadingDestination,
    ReadingPayload,
    WaitingForEtx,
    ReadingCrc,
}

/// Incremental byte-at-a-time state machine that turns a raw stream of octets back
/// into framed [`Packet`]s. One parser is owned per adaptor/stream; it is fed bytes
/// as they arrive and hands back a completed packet whenever a full frame validates.
///
/// Any framing violation - a bad STX, an oversized length, a missing ETX, or (when
/// `Flags::CRC` is set) a checksum mismatch - resets the parser back to
/// `WaitingForStx` and discards everything accumulated so far, exactly as a stream
/// resynchronizes after a dropped or corrupted frame.
pub struct PacketParser {
    state: State,
    length: u32,
    flags: Flags,
    source: u16,
    destination: u16,
    field_buf: [u8; 4],
    field_filled: usize,
    payload_remaining: usize,
    packet: Option<Packet>,
}

impl PacketParser {
    pub fn new() -> PacketParser {
        PacketParser {
            state: State::WaitingForStx,
            length: 0,
            flags: Flags::NONE,
            source: 0,
            destination: 0,
            field_buf: [0; 4],
            field_filled: 0,
            payload_remaining: 0,
            packet: None,
        }
    }

    fn reset(&mut self) {
        self.state = State::WaitingForStx;
        self.payload_remaining = 0;
        self.length = 0;
        self.flags = Flags::NONE;
        self.source = 0;
        self.destination = 0;
        self.field_filled = 0;
        self.packet = None;
    }

    /// Feeds a batch of bytes through the state machine, returning every packet
    /// that completed along the way (a single call may yield more than one frame
    /// when several arrived back to back).
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
        let mut out = Vec::new();
        for &byte in bytes {
            if let Some(packet) = self.push_byte(byte) {
                out.push(packet);
            }
        }
        out
    }

    /// Advances the state machine by one byte. Returns a completed, validated
    /// packet if this byte closed out a frame.
    pub fn push_byte(&mut self, byte: u8) -> Option<Packet> {
        match self.state {
            State::WaitingForStx => {
                if byte == STX {
                    self.field_filled = 0;
                    self.state = State::ReadingLength;
                }
                None
            }
            State::ReadingLength => {
                self.field_buf[self.field_filled] = byte;
                self.field_filled += 1;
                if self.field_filled == 4 {
                    self.length = u32::from_be_bytes(self.field_buf);
                    if self.length < (FRAMING_OVERHEAD as u32) || self.length > MAX_TOTAL_LENGTH {
                        self.reset();
                        return None;
                    }
                    self.state = State::ReadingFlags;
                }
                None
            }
            State::ReadingFlags => {
                self.flags = Flags::from_bits_truncate(byte);
                self.field_filled = 0;
                self.state = State::ReadingSource;
                None
            }
            State::ReadingSource => {
                self.field_buf[self.field_filled] = byte;
                self.field_filled += 1;
                if self.field_filled == 2 {
                    self.source = u16::from_be_bytes([self.field_buf[0], self.field_buf[1]]);
                    self.field_filled = 0;
                    self.state = State::ReadingDestination;
                }
                None
            }
            State::ReadingDestination => {
                self.field_buf[self.field_filled] = byte;
                self.field_filled += 1;
                if self.field_filled == 2 {
                    self.destination = u16::from_be_bytes([self.field_buf[0], self.field_buf[1]]);
                    self.begin_payload();
                }
                None
            }
            State::ReadingPayload => {
                let packet = self.packet.as_mut().expect("packet started once header is complete");
                packet.write_bytes(&[byte]);
                self.payload_remaining -= 1;
                if self.payload_remaining == 0 {
                    self.state = State::WaitingForEtx;
                }
                None
            }
            State::WaitingForEtx => {
                if byte != ETX {
                    self.reset();
                    return None;
                }
                let packet = self.packet.as_mut().expect("packet started once header is complete");
                packet.write_bytes(&[byte]);
                if self.flags.contains(Flags::CRC) {
                    self.field_filled = 0;
                    self.state = State::ReadingCrc;
                    None
                } else {
                    self.finish(None)
                }
            }
            State::ReadingCrc => {
                self.field_buf[self.field_filled] = byte;
                self.field_filled += 1;
                if self.field_filled == 4 {
                    let crc = u32::from_be_bytes(self.field_buf);
                    return self.finish(Some(crc));
                }
                None
            }
        }
    }

    fn begin_payload(&mut self) {
        let crc_tail = if self.flags.contains(Flags::CRC) { 4 } else { 0 };
        let payload_len = self.length as usize - HEADER_SIZE - 1 - crc_tail;
        let packet = Packet::new(payload_len as u32, self.flags, self.source, self.destination);
        self.packet = Some(packet);
        self.payload_remaining = payload_len;
        self.state = if payload_len == 0 { State::WaitingForEtx } else { State::ReadingPayload };
    }

    fn finish(&mut self, received_crc: Option<u32>) -> Option<Packet> {
        let mut packet = self.packet.take().expect("packet present at frame completion");

        if let Some(crc) = received_crc {
            let body_end = packet.written_len();
            let computed = crc32fast::hash(&packet.data()[..body_end]);
            if computed != crc {
                self.reset();
                return None;
            }
            packet.write(crc);
        }

        packet.mark_sealed();
        self.reset();
        Some(packet)
    }
}

impl Default for PacketParser {
    fn default() -> PacketParser {
        PacketParser::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    #[test]
    fn parses_a_packet_fed_one_byte_at_a_time() {
        let mut source = Packet::new(3, Flags::NONE, 1, 2);
        source.write_bytes(&[9, 8, 7]);
        source.seal();

        let mut parser = PacketParser::new();
        let mut produced = None;
        for &byte in source.data() {
            if let Some(packet) = parser.push_byte(byte) {
                produced = Some(packet);
            }
        }

        let packet = produced.expect("frame should have completed");
        assert_eq!(packet.source(), 1);
        assert_eq!(packet.destination(), 2);
        assert_eq!(packet.payload(), &[9, 8, 7]);
    }

    #[test]
    fn validates_crc_when_flag_is_set() {
        let mut source = Packet::new(2, Flags::CRC, 4, 5);
        source.write_bytes(&[1, 2]);
        source.seal();

        let mut parser = PacketParser::new();
        let packets = parser.feed(source.data());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload(), &[1, 2]);
    }

    #[test]
    fn corrupted_crc_drops_the_frame() {
        let mut source = Packet::new(2, Flags::CRC, 4, 5);
        source.write_bytes(&[1, 2]);
        source.seal();

        let mut bytes = source.data().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let mut parser = PacketParser::new();
        let packets = parser.feed(&bytes);
        assert!(packets.is_empty());
    }

    #[test]
    fn resyncs_after_garbage_before_stx() {
        let mut source = Packet::new(1, Flags::NONE, 0, 0);
        source.write_bytes(&[42]);
        source.seal();

        let mut bytes = vec![0xFF, 0xFF, 0x10];
        bytes.extend_from_slice(source.data());

        let mut parser = PacketParser::new();
        let packets = parser.feed(&bytes);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload(), &[42]);
    }

    #[test]
    fn oversized_length_resets_the_parser() {
        let mut parser = PacketParser::new();
        assert!(parser.push_byte(STX).is_none());
        for byte in &(MAX_TOTAL_LENGTH + 1).to_be_bytes() {
            parser.push_byte(*byte);
        }
        assert_eq!(parser.state, State::WaitingForStx);
    }
}
