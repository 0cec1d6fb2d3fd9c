use crate::node::Transmitter;
use crate::packet::Packet;
use crate::parser::PacketParser;
use crate::router::Router;
use crate::stream::Stream;
use std::any::Any;

/// Maximum number of zero-byte-accepted retries before a stream-backed transmit
/// gives up and reports failure.
const MAX_TRANSMIT_RETRIES: usize = 100;

/// Bidirectional packet conduit between a router and a peer (another router, or a
/// raw byte transport). Identity/enumeration bookkeeping common to every concrete
/// adaptor lives in [`AdaptorState`]; `Router` addresses adaptors purely through
/// this trait.
pub trait Adaptor: Transmitter + Any {
    fn adaptor_id(&self) -> u16;
    fn set_adaptor_id(&mut self, id: u16);
    fn is_active(&self) -> bool;
    fn set_active(&mut self, active: bool);
    fn is_enumerated(&self) -> bool;
    fn set_enumerated(&mut self, enumerated: bool);
    fn is_re_enumerated(&self) -> bool;
    fn set_re_enumerated(&mut self, re_enumerated: bool);

    /// Hands a packet obtained from this adaptor's transport to its local router.
    fn on_receive(&mut self, packet: Packet);

    /// Lets `Router` recover a concrete adaptor type (needed only to wire up
    /// `SimpleAdaptor` peers after both sides are registered).
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Default)]
pub struct AdaptorState {
    id: u16,
    active: bool,
    enumerated: bool,
    re_enumerated: bool,
}

impl AdaptorState {
    fn set_active(&mut self, active: bool) {
        self.active = active;
        if active {
            self.enumerated = false;
        }
    }
}

/// Two in-memory adaptors wired directly to each other's router, standing in for
/// a physical link between two collocated routers (as used by the multi-router
/// test scenarios).
pub struct SimpleAdaptor {
    state: AdaptorState,
    local_router: Option<Router>,
    peer_router: Option<Router>,
    peer_adaptor_id: u16,
}

impl SimpleAdaptor {
    fn new() -> SimpleAdaptor {
        SimpleAdaptor { state: AdaptorState::default(), local_router: None, peer_router: None, peer_adaptor_id: 0 }
    }

    pub fn attach_local_router(&mut self, router: Router) {
        self.local_router = Some(router);
    }

    fn attach_peer(&mut self, peer_router: Router, peer_adaptor_id: u16) {
        self.peer_router = Some(peer_router);
        self.peer_adaptor_id = peer_adaptor_id;
    }
}

/// Creates a pair of `SimpleAdaptor`s, registers one with each router, and wires
/// them to each other so a packet transmitted on one side is delivered to the
/// other router's `receive_from_adaptor` synchronously.
pub fn link_routers(a: &Router, b: &Router) {
    let mut adaptor_a = SimpleAdaptor::new();
    adaptor_a.attach_local_router(a.clone());
    let id_a = a.add_adaptor(Box::new(adaptor_a));

    let mut adaptor_b = SimpleAdaptor::new();
    adaptor_b.attach_local_router(b.clone());
    let id_b = b.add_adaptor(Box::new(adaptor_b));

    a.with_adaptor_mut(id_a, |adaptor| {
        if let Some(simple) = adaptor.as_any_mut().downcast_mut::<SimpleAdaptor>() {
            simple.attach_peer(b.clone(), id_b);
        }
    });
    b.with_adaptor_mut(id_b, |adaptor| {
        if let Some(simple) = adaptor.as_any_mut().downcast_mut::<SimpleAdaptor>() {
            simple.attach_peer(a.clone(), id_a);
        }
    });

    a.set_adaptor_active(id_a, true);
    b.set_adaptor_active(id_b, true);
}

impl Transmitter for SimpleAdaptor {
    fn transmit(&mut self, packet: Packet) -> bool {
        match &self.peer_router {
            Some(peer) => {
                peer.receive_from_adaptor(self.peer_adaptor_id, packet);
                true
            }
            None => false,
        }
    }
}

impl Adaptor for SimpleAdaptor {
    fn adaptor_id(&self) -> u16 {
        self.state.id
    }
    fn set_adaptor_id(&mut self, id: u16) {
        self.state.id = id;
    }
    fn is_active(&self) -> bool {
        self.state.active
    }
    fn set_active(&mut self, active: bool) {
        self.state.set_active(active);
    }
    fn is_enumerated(&self) -> bool {
        self.state.enumerated
    }
    fn set_enumerated(&mut self, enumerated: bool) {
        self.state.enumerated = enumerated;
    }
    fn is_re_enumerated(&self) -> bool {
        self.state.re_enumerated
    }
    fn set_re_enumerated(&mut self, re_enumerated: bool) {
        self.state.re_enumerated = re_enumerated;
    }

    fn on_receive(&mut self, packet: Packet) {
        if let Some(router) = &self.local_router {
            router.receive_from_adaptor(self.state.id, packet);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Drives a [`PacketParser`] over a real byte [`Stream`] - a serial port, pipe, or
/// socket. `poll` should be called every tick; it drains whatever the stream has
/// buffered and forwards every packet that completes.
pub struct NotifyingStreamAdaptor {
    state: AdaptorState,
    local_router: Option<Router>,
    stream: Box<dyn Stream>,
    parser: PacketParser,
}

impl NotifyingStreamAdaptor {
    pub fn new(stream: Box<dyn Stream>) -> NotifyingStreamAdaptor {
        NotifyingStreamAdaptor { state: AdaptorState::default(), local_router: None, stream, parser: PacketParser::new() }
    }

    pub fn attach_local_router(&mut self, router: Router) {
        self.local_router = Some(router);
    }

    pub fn poll(&mut self) {
        if !self.stream.is_valid() {
            return;
        }

        let pending = self.stream.bytes_received();
        if pending == 0 {
            return;
        }

        let mut buf = vec![0u8; pending];
        let read = self.stream.read(&mut buf);
        let packets = self.parser.feed(&buf[..read]);

        for packet in packets {
            self.on_receive(packet);
        }
    }
}

impl Transmitter for NotifyingStreamAdaptor {
    fn transmit(&mut self, mut packet: Packet) -> bool {
        packet.reset_read();
        let data = packet.data().to_vec();
        let mut written = 0;
        let mut retries = 0;

        while written < data.len() && retries < MAX_TRANSMIT_RETRIES {
            let n = self.stream.write(&data[written..]);
            if n == 0 {
                retries += 1;
                continue;
            }
            written += n;
        }

        written == data.len()
    }
}

impl Adaptor for NotifyingStreamAdaptor {
    fn adaptor_id(&self) -> u16 {
        self.state.id
    }
    fn set_adaptor_id(&mut self, id: u16) {
        self.state.id = id;
    }
    fn is_active(&self) -> bool {
        self.state.active
    }
    fn set_active(&mut self, active: bool) {
        self.state.set_active(active);
    }
    fn is_enumerated(&self) -> bool {
        self.state.enumerated
    }
    fn set_enumerated(&mut self, enumerated: bool) {
        self.state.enumerated = enumerated;
    }
    fn is_re_enumerated(&self) -> bool {
        self.state.re_enumerated
    }
    fn set_re_enumerated(&mut self, re_enumerated: bool) {
        self.state.re_enumerated = re_enumerated;
    }

    fn on_receive(&mut self, packet: Packet) {
        if let Some(router) = &self.local_router {
            router.receive_from_adaptor(self.state.id, packet);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::LoopbackStream;
    use crate::packet::Flags;

    #[test]
    fn stream_adaptor_transmit_writes_sealed_bytes() {
        let stream = LoopbackStream::new();
        let mut adaptor = NotifyingStreamAdaptor::new(Box::new(stream));

        let mut packet = Packet::new(1, Flags::NONE, 1, 2);
        packet.write_bytes(&[7]);
        packet.seal();

        assert!(adaptor.transmit(packet));
    }

    #[test]
    fn set_active_clears_enumerated_flag() {
        let mut state = AdaptorState::default();
        state.enumerated = true;
        state.set_active(true);
        assert!(!state.enumerated);
    }
}
