use crate::command::{CommandManager, NodeAccess, ResponseOutcome};
use crate::guid::Guid;
use crate::opcode;
use crate::packet::{Packet, MASTER_ADDRESS, UNASSIGNED_ADDRESS};
use crate::transaction::{CommandFlags, OutgoingTransaction, ResponseCode};
use idp_support::logging::{self, Logger};
use idp_support::NetworkConfig;

/// Anything a node's packets can be handed off to for delivery. `Router` (via its
/// `Rc<RefCell<RouterInner>>` handle) and the concrete adaptor types are the two
/// implementers in this crate.
pub trait Transmitter {
    fn transmit(&mut self, packet: Packet) -> bool;
}

/// The identity and liveness state shared by every addressable endpoint: plain
/// nodes, routers, and the master all embed one of these and expose it through
/// [`NodeAccess`].
pub struct NodeCore {
    address: u16,
    guid: Guid,
    name: String,
    next_txid: u32,
    liveness_timeout_ms: u64,
    ping_interval_ms: u64,
    last_ping: u64,
    last_ping_attempt: u64,
    transmit: Option<Box<dyn Transmitter>>,
}

impl NodeCore {
    pub fn new(guid: Guid, name: impl Into<String>, config: &NetworkConfig) -> NodeCore {
        NodeCore {
            address: UNASSIGNED_ADDRESS,
            guid,
            name: name.into(),
            next_txid: 1,
            liveness_timeout_ms: config.liveness_timeout_ms,
            ping_interval_ms: config.ping_interval_ms,
            last_ping: 0,
            last_ping_attempt: 0,
            transmit: None,
        }
    }

    #[inline]
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Assigns a new address, as happens once during enumeration. Resets the
    /// liveness clock so the next tick doesn't immediately judge the node dead.
    pub fn set_address(&mut self, address: u16, now: u64) {
        self.address = address;
        self.last_ping = now;
        self.last_ping_attempt = 0;
    }

    pub fn clear_address(&mut self) {
        self.address = UNASSIGNED_ADDRESS;
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn liveness_timeout_ms(&self) -> u64 {
        self.liveness_timeout_ms
    }

    pub fn next_txid(&mut self) -> u32 {
        let txid = self.next_txid;
        self.next_txid += 1;
        txid
    }

    pub fn set_transmit(&mut self, transmit: Box<dyn Transmitter>) {
        self.transmit = Some(transmit);
    }

    pub fn transmit(&mut self, packet: Packet) -> bool {
        match self.transmit.as_mut() {
            Some(endpoint) => endpoint.transmit(packet),
            None => false,
        }
    }
}

impl NodeAccess for NodeCore {
    fn node(&self) -> &NodeCore {
        self
    }
    fn node_mut(&mut self) -> &mut NodeCore {
        self
    }
}

/// Registers the four built-in commands (`Ping`, `GetNodeInfo`, `QueryInterface`,
/// `Reset`) and the persistent `Ping` response handler every node, router, and
/// master carries. Shared across concrete node types the way the source's `Node`
/// base class shared them with every subclass.
pub fn register_builtin_commands<C: NodeAccess + 'static>(commands: &mut CommandManager<C>) {
    commands.register_command_handler(
        opcode::PING,
        Box::new(|_ctx, _mgr, _now, _incoming, _outgoing| ResponseCode::Ok),
    );

    commands.register_response_handler(
        opcode::PING,
        Box::new(|ctx, _mgr, now, outcome| {
            if let ResponseOutcome::Received(ResponseCode::Ok, _) = outcome {
                ctx.node_mut().last_ping = now;
            }
        }),
    );

    commands.register_command_handler(
        opcode::GET_NODE_INFO,
        Box::new(|ctx, _mgr, _now, _incoming, outgoing| {
            let guid = ctx.node().guid();
            let name = ctx.node().name().to_string();
            let timeout = ctx.node().liveness_timeout_ms() as u32;
            outgoing.write_guid(&guid);
            outgoing.write_cstring(&name);
            outgoing.write(timeout);
            ResponseCode::Ok
        }),
    );

    commands.register_command_handler(
        opcode::QUERY_INTERFACE,
        Box::new(|ctx, _mgr, _now, incoming, _outgoing| {
            let requested = match incoming.read_guid() {
                Ok(guid) => guid,
                Err(_) => return ResponseCode::InvalidParameters,
            };

            if requested != ctx.node().guid() {
                return ResponseCode::Ok;
            }

            let mut reply =
                OutgoingTransaction::create_response(incoming.txid(), ResponseCode::Ok, opcode::QUERY_INTERFACE);
            let guid = ctx.node().guid();
            reply.write_guid(&guid);
            let own_address = ctx.node().address();
            let packet = reply.to_packet(own_address, incoming.source(), crate::packet::Flags::NONE);
            ctx.node_mut().transmit(packet);
            ResponseCode::Deferred
        }),
    );

    commands.register_command_handler(
        opcode::RESET,
        Box::new(|ctx, _mgr, _now, _incoming, _outgoing| {
            ctx.on_reset();
            ResponseCode::Ok
        }),
    );
}

/// Drives the 1 Hz self-liveness ping: a node that hasn't heard back from its own
/// pings in `liveness_timeout_ms` resets itself; otherwise it re-pings the master
/// at the node's own `ping_interval_ms` cadence. A node at address 1 (the master)
/// or with an unassigned address never pings.
pub fn tick_liveness<C: NodeAccess + 'static>(ctx: &mut C, commands: &mut CommandManager<C>, now: u64) {
    let address = ctx.node().address();
    if address == MASTER_ADDRESS || address == UNASSIGNED_ADDRESS {
        return;
    }

    let (last_ping, last_attempt, interval, timeout) = {
        let node = ctx.node();
        (node.last_ping, node.last_ping_attempt, node.ping_interval_ms, node.liveness_timeout_ms)
    };

    if now.saturating_sub(last_ping) > timeout {
        ctx.on_reset();
        return;
    }

    if now.saturating_sub(last_attempt) < interval {
        return;
    }

    ctx.node_mut().last_ping_attempt = now;

    if !send_request(ctx, commands, now, opcode::PING, CommandFlags::RESPONSE_EXPECTED, MASTER_ADDRESS, |_| {}, None) {
        ctx.on_reset();
    }
}

/// Builds and transmits a request, optionally registering a one-shot handler for
/// its response. Returns `false` (and unregisters any handler just added) if the
/// underlying transmit failed.
pub fn send_request<C: NodeAccess + 'static>(
    ctx: &mut C,
    commands: &mut CommandManager<C>,
    now: u64,
    cmd: u16,
    flags: CommandFlags,
    destination: u16,
    build_body: impl FnOnce(&mut OutgoingTransaction),
    handler: Option<crate::command::ResponseHandler<C>>,
) -> bool {
    let txid = ctx.node_mut().next_txid();
    let mut outgoing = OutgoingTransaction::create(cmd, txid, flags);
    build_body(&mut outgoing);

    if let Some(handler) = handler {
        commands.register_one_time_response_handler(txid, now, handler);
    }

    let source = ctx.node().address();
    let packet = outgoing.to_packet(source, destination, crate::packet::Flags::NONE);

    if ctx.node_mut().transmit(packet) {
        true
    } else {
        commands.unregister_one_time_response_handler(txid);
        false
    }
}

/// A standalone addressable endpoint: identity plus command dispatch, with no
/// router/master responsibilities of its own. Concrete embedded leaf nodes are
/// built directly from this type.
pub struct Node {
    pub core: NodeCore,
    pub commands: CommandManager<NodeCore>,
    log: Logger,
}

impl Node {
    pub fn new(guid: Guid, name: impl Into<String>, config: &NetworkConfig, log: Logger) -> Node {
        let core = NodeCore::new(guid, name, config);
        let mut commands = CommandManager::new(config.transaction_timeout_ms, log.new(logging::o!()));
        register_builtin_commands(&mut commands);
        Node { core, commands, log }
    }

    pub fn attach_transmit(&mut self, transmit: Box<dyn Transmitter>) {
        self.core.set_transmit(transmit);
    }

    pub fn address(&self) -> u16 {
        self.core.address()
    }

    pub fn set_address(&mut self, address: u16, now: u64) {
        self.core.set_address(address, now);
    }

    /// Runs an inbound packet through the command manager, returning any reply
    /// to send back.
    pub fn handle_packet(&mut self, now: u64, packet: Packet) -> Option<Packet> {
        match self.commands.process_payload(&mut self.core, now, packet) {
            Ok(reply) => reply,
            Err(err) => {
                logging::debug!(self.log, "dropped malformed packet"; "error" => %err);
                None
            }
        }
    }

    /// Advances liveness and timeout bookkeeping. Call at whatever cadence the
    /// host scheduler offers; internally gated to the node's own intervals.
    pub fn tick(&mut self, now: u64) {
        tick_liveness(&mut self.core, &mut self.commands, now);
        self.commands.invalidate_timeouts(&mut self.core, now);
    }

    pub fn send_request(
        &mut self,
        now: u64,
        cmd: u16,
        flags: CommandFlags,
        destination: u16,
        build_body: impl FnOnce(&mut OutgoingTransaction),
        handler: Option<crate::command::ResponseHandler<NodeCore>>,
    ) -> bool {
        send_request(&mut self.core, &mut self.commands, now, cmd, flags, destination, build_body, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Flags;
    use crate::transaction::{CommandFlags, IncomingTransaction};
    use idp_support::logging;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct RecordingTransmitter {
        sent: Rc<RefCell<Vec<Packet>>>,
    }

    impl Transmitter for RecordingTransmitter {
        fn transmit(&mut self, packet: Packet) -> bool {
            self.sent.borrow_mut().push(packet);
            true
        }
    }

    #[test]
    fn ping_command_replies_ok() {
        let config = NetworkConfig::default();
        let mut node = Node::new(Guid::from_fields(1, 2, 3, [0; 8]), "n", &config, logging::discard());
        node.core.set_address(5, 0);

        let request = OutgoingTransaction::create(opcode::PING, 1, CommandFlags::RESPONSE_EXPECTED);
        let packet = request.to_packet(1, 5, Flags::NONE);

        let reply = node.handle_packet(0, packet).expect("ping should reply");
        let mut incoming = IncomingTransaction::from_packet(reply).unwrap();
        assert_eq!(incoming.cmd(), opcode::RESPONSE);
        assert_eq!(incoming.read::<u8>(), ResponseCode::Ok as u8);
    }

    #[test]
    fn get_node_info_reports_identity() {
        let config = NetworkConfig::default();
        let guid = Guid::from_fields(0xAABBCCDD, 1, 2, [3; 8]);
        let mut node = Node::new(guid, "child-node", &config, logging::discard());
        node.core.set_address(7, 0);

        let request = OutgoingTransaction::create(opcode::GET_NODE_INFO, 1, CommandFlags::RESPONSE_EXPECTED);
        let packet = request.to_packet(1, 7, Flags::NONE);

        let reply = node.handle_packet(0, packet).unwrap();
        let mut incoming = IncomingTransaction::from_packet(reply).unwrap();
        incoming.read::<u8>();
        incoming.read::<u16>();
        assert_eq!(incoming.read_guid().unwrap(), guid);
        assert_eq!(incoming.read_cstring().unwrap(), "child-node");
    }

    #[test]
    fn query_interface_defers_and_replies_only_for_matching_guid() {
        let config = NetworkConfig::default();
        let own_guid = Guid::from_fields(1, 1, 1, [1; 8]);
        let mut node = Node::new(own_guid, "n", &config, logging::discard());
        node.core.set_address(3, 0);

        let sent = Rc::new(RefCell::new(Vec::new()));
        node.attach_transmit(Box::new(RecordingTransmitter { sent: sent.clone() }));

        let mut request = OutgoingTransaction::create(opcode::QUERY_INTERFACE, 1, CommandFlags::RESPONSE_EXPECTED);
        request.write_guid(&own_guid);
        let packet = request.to_packet(1, 3, Flags::NONE);

        let reply = node.handle_packet(0, packet);
        assert!(reply.is_none(), "matching guid defers the automatic reply");
        assert_eq!(sent.borrow().len(), 1, "handler should have sent its own reply");
    }

    #[test]
    fn reset_command_clears_the_address() {
        let config = NetworkConfig::default();
        let mut node = Node::new(Guid::from_fields(1, 2, 3, [0; 8]), "n", &config, logging::discard());
        node.core.set_address(9, 0);

        let request = OutgoingTransaction::create(opcode::RESET, 1, CommandFlags::NONE);
        let packet = request.to_packet(1, 9, Flags::NONE);
        node.handle_packet(0, packet);

        assert_eq!(node.address(), UNASSIGNED_ADDRESS);
    }

    #[test]
    fn stale_liveness_resets_the_node() {
        let config = NetworkConfig::default();
        let mut node = Node::new(Guid::from_fields(1, 2, 3, [0; 8]), "n", &config, logging::discard());
        node.attach_transmit(Box::new(RecordingTransmitter { sent: Rc::new(RefCell::new(Vec::new())) }));
        node.core.set_address(4, 0);

        node.tick(config.liveness_timeout_ms + 1);
        assert_eq!(node.address(), UNASSIGNED_ADDRESS);
    }
}
