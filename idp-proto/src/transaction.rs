use crate::guid::Guid;
use crate::opcode;
use crate::packet::{Flags, Packet, WireScalar};
use idp_support::{ErrorKind, IdpResult};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct CommandFlags: u8 {
        const NONE = 0;
        const RESPONSE_EXPECTED = 0x01;
    }
}

/// Outcome of a command handler, patched into the automatic response unless the
/// handler defers and replies itself later.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0,
    UnknownCommand = 1,
    InvalidParameters = 2,
    UnknownError = 3,
    NotReady = 4,
    Deferred = 5,
    Internal = 6,
}

impl ResponseCode {
    pub fn from_u8(value: u8) -> ResponseCode {
        match value {
            0 => ResponseCode::Ok,
            1 => ResponseCode::UnknownCommand,
            2 => ResponseCode::InvalidParameters,
            3 => ResponseCode::UnknownError,
            4 => ResponseCode::NotReady,
            5 => ResponseCode::Deferred,
            _ => ResponseCode::Internal,
        }
    }
}

/// A received command payload, positioned for typed reads of the body that follows
/// the `cmd | txid | flags` header every command payload starts with.
pub struct IncomingTransaction {
    cmd: u16,
    txid: u32,
    flags: CommandFlags,
    source: u16,
    packet: Packet,
}

impl IncomingTransaction {
    pub fn from_packet(mut packet: Packet) -> IdpResult<IncomingTransaction> {
        if packet.payload_len() < 7 {
            return Err(ErrorKind::MalformedFraming);
        }

        packet.reset_read_to_payload();
        let cmd = packet.read::<u16>();
        let txid = packet.read::<u32>();
        let flags = CommandFlags::from_bits_truncate(packet.read::<u8>());
        let source = packet.source();

        Ok(IncomingTransaction { cmd, txid, flags, source, packet })
    }

    #[inline]
    pub fn cmd(&self) -> u16 {
        self.cmd
    }

    #[inline]
    pub fn txid(&self) -> u32 {
        self.txid
    }

    #[inline]
    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    #[inline]
    pub fn response_expected(&self) -> bool {
        self.flags.contains(CommandFlags::RESPONSE_EXPECTED)
    }

    /// Address the packet carrying this transaction arrived from.
    #[inline]
    pub fn source(&self) -> u16 {
        self.source
    }

    #[inline]
    pub fn read<T: WireScalar>(&mut self) -> T {
        self.packet.read::<T>()
    }

    #[inline]
    pub fn read_bytes(&mut self, len: usize) -> &[u8] {
        self.packet.read_bytes(len)
    }

    pub fn read_guid(&mut self) -> IdpResult<Guid> {
        let bytes = self.packet.read_bytes(16);
        Guid::read(bytes).map_err(|_| ErrorKind::MalformedFraming)
    }

    /// Reads a NUL-terminated UTF-8 string, returning ownership to the caller.
    pub fn read_cstring(&mut self) -> IdpResult<String> {
        let mut bytes = Vec::new();
        loop {
            let byte = self.packet.read::<u8>();
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        String::from_utf8(bytes).map_err(|_| ErrorKind::MalformedFraming)
    }
}

/// Builder for a command (or response) payload, finalised into a sealed [`Packet`]
/// via [`OutgoingTransaction::to_packet`].
#[derive(Debug, Clone)]
pub struct OutgoingTransaction {
    buffer: Vec<u8>,
}

impl OutgoingTransaction {
    pub fn create(cmd: u16, txid: u32, flags: CommandFlags) -> OutgoingTransaction {
        let mut buffer = Vec::with_capacity(7);
        buffer.extend_from_slice(&cmd.to_be_bytes());
        buffer.extend_from_slice(&txid.to_be_bytes());
        buffer.push(flags.bits());
        OutgoingTransaction { buffer }
    }

    /// Seeds a `Response` payload carrying `code` and the opcode it answers.
    pub fn create_response(txid: u32, code: ResponseCode, original_cmd: u16) -> OutgoingTransaction {
        let mut tx = OutgoingTransaction::create(opcode::RESPONSE, txid, CommandFlags::NONE);
        tx.write(code as u8);
        tx.write(original_cmd);
        tx
    }

    pub fn write<T: WireScalar>(&mut self, value: T) {
        let mut buf = [0u8; 4];
        value.write_be(&mut buf[..T::SIZE]);
        self.buffer.extend_from_slice(&buf[..T::SIZE]);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_guid(&mut self, guid: &Guid) {
        let mut out = Vec::with_capacity(16);
        guid.write(&mut out).expect("writing to a Vec cannot fail");
        self.buffer.extend_from_slice(&out);
    }

    /// NUL-terminates `value` on the wire.
    pub fn write_cstring(&mut self, value: &str) {
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.push(0);
    }

    /// Patches the response-code byte of a payload created by
    /// [`OutgoingTransaction::create_response`], at offset 7 (right after the
    /// `cmd|txid|flags` header).
    pub fn with_response_code(&mut self, code: ResponseCode) {
        if self.buffer.len() > 7 {
            self.buffer[7] = code as u8;
        }
    }

    #[inline]
    pub fn txid(&self) -> u32 {
        u32::from_be_bytes([self.buffer[2], self.buffer[3], self.buffer[4], self.buffer[5]])
    }

    /// Finalises this transaction into a sealed packet. Non-consuming: the
    /// `QueryInterface` idiom writes into a transaction, sends it manually, and
    /// lets `CommandManager` fall back to sealing the same buffer automatically
    /// if the handler did not return `Deferred`.
    pub fn to_packet(&self, source: u16, destination: u16, packet_flags: Flags) -> Packet {
        let mut packet = Packet::new(self.buffer.len() as u32, packet_flags, source, destination);
        packet.write_bytes(&self.buffer);
        packet.seal();
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_packet(cmd: u16, txid: u32, flags: CommandFlags, body: &[u8]) -> Packet {
        let mut tx = OutgoingTransaction::create(cmd, txid, flags);
        tx.write_bytes(body);
        tx.to_packet(5, 9, Flags::NONE)
    }

    #[test]
    fn incoming_transaction_parses_command_header() {
        let packet = command_packet(opcode::PING, 42, CommandFlags::RESPONSE_EXPECTED, &[1, 2, 3]);
        let mut incoming = IncomingTransaction::from_packet(packet).unwrap();

        assert_eq!(incoming.cmd(), opcode::PING);
        assert_eq!(incoming.txid(), 42);
        assert!(incoming.response_expected());
        assert_eq!(incoming.source(), 5);
        assert_eq!(incoming.read::<u8>(), 1);
        assert_eq!(incoming.read_bytes(2), &[2, 3]);
    }

    #[test]
    fn cstring_reads_stop_at_nul() {
        let mut tx = OutgoingTransaction::create(opcode::GET_NODE_INFO, 1, CommandFlags::NONE);
        tx.write_cstring("node-a");
        tx.write(99u8);
        let packet = tx.to_packet(1, 1, Flags::NONE);

        let mut incoming = IncomingTransaction::from_packet(packet).unwrap();
        assert_eq!(incoming.read_cstring().unwrap(), "node-a");
        assert_eq!(incoming.read::<u8>(), 99);
    }

    #[test]
    fn response_code_patch_targets_offset_seven() {
        let mut tx = OutgoingTransaction::create_response(7, ResponseCode::Ok, opcode::PING);
        tx.with_response_code(ResponseCode::InvalidParameters);
        let packet = tx.to_packet(1, 2, Flags::NONE);

        let mut incoming = IncomingTransaction::from_packet(packet).unwrap();
        assert_eq!(incoming.cmd(), opcode::RESPONSE);
        assert_eq!(incoming.read::<u8>(), ResponseCode::InvalidParameters as u8);
        assert_eq!(incoming.read::<u16>(), opcode::PING);
    }
}
