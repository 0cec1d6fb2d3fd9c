use std::fmt;

/// Error conditions surfaced by the protocol layer. None of these are fatal to the
/// host process: every one of them reduces to a dropped packet, a cleared address or
/// a reaped node (see the error handling table in the design notes).
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum ErrorKind {
    /// Packet length field exceeded the maximum allowed payload size.
    OversizedPacket,
    /// Framing byte did not match the expected marker (STX/ETX).
    MalformedFraming,
    /// CRC validation failed on a sealed packet.
    CrcMismatch,
    /// Attempted to write into an already-sealed packet.
    PacketSealed,
    /// The host transport reported a transmit failure.
    TransmitFailed,
    /// No route exists to the requested destination in a router's routing table.
    UnknownRoute,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ErrorKind::OversizedPacket => "packet length exceeds the maximum allowed size",
            ErrorKind::MalformedFraming => "malformed packet framing",
            ErrorKind::CrcMismatch => "crc validation failed",
            ErrorKind::PacketSealed => "attempted to write into a sealed packet",
            ErrorKind::TransmitFailed => "transmit failed",
            ErrorKind::UnknownRoute => "unknown route",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ErrorKind {}

pub type IdpResult<T> = Result<T, ErrorKind>;

/// Mirrors the `has_failed()` helper the networking layer uses to distinguish a
/// recoverable "would block" condition from a genuine failure. The protocol core has
/// no "would block" case of its own (reads/writes happen against in-memory buffers),
/// but downstream adaptors built on real streams reuse this trait.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for IdpResult<T> {
    fn has_failed(&self) -> bool {
        self.is_err()
    }
}
