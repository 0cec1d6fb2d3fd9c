/// A byte-oriented transport a [`crate::parser::PacketParser`] can be driven from
/// and a sealed [`crate::packet::Packet`] can be written to. Adaptors own one of
/// these; `SimpleAdaptor` bypasses it entirely by handing packets directly to a
/// peer router, while `NotifyingStreamAdaptor` drives one every tick.
pub trait Stream {
    /// Whether the underlying transport is still usable. A stream that goes
    /// invalid is never read from or written to again until reconnected.
    fn is_valid(&self) -> bool;

    /// Bytes currently buffered and ready to be read without blocking.
    fn bytes_received(&self) -> usize;

    /// Reads up to `buf.len()` bytes, returning how many were actually copied.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Queues `data` for transmission, returning how many bytes were accepted.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Tears down the transport. Idempotent.
    fn close(&mut self);
}

/// An in-memory [`Stream`] backed by two byte FIFOs, one per direction. Used by
/// tests and by `NotifyingStreamAdaptor` examples to exercise the parser without a
/// real socket or serial port.
#[derive(Debug, Default)]
pub struct LoopbackStream {
    inbound: std::collections::VecDeque<u8>,
    outbound: Vec<u8>,
    valid: bool,
}

impl LoopbackStream {
    pub fn new() -> LoopbackStream {
        LoopbackStream { inbound: Default::default(), outbound: Vec::new(), valid: true }
    }

    /// Injects bytes as if they had just arrived from the peer.
    pub fn deliver(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes);
    }

    /// Drains and returns everything written to this stream so far.
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }
}

impl Stream for LoopbackStream {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn bytes_received(&self) -> usize {
        self.inbound.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.inbound.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn write(&mut self, data: &[u8]) -> usize {
        self.outbound.extend_from_slice(data);
        data.len()
    }

    fn close(&mut self) {
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_stream_round_trips_bytes() {
        let mut stream = LoopbackStream::new();
        stream.deliver(&[1, 2, 3]);
        assert_eq!(stream.bytes_received(), 3);

        let mut buf = [0u8; 2];
        assert_eq!(stream.read(&mut buf), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(stream.bytes_received(), 1);

        stream.write(&[9, 9]);
        assert_eq!(stream.take_written(), vec![9, 9]);
    }

    #[test]
    fn close_invalidates_the_stream() {
        let mut stream = LoopbackStream::new();
        assert!(stream.is_valid());
        stream.close();
        assert!(!stream.is_valid());
    }
}
