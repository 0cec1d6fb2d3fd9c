use crate::adaptor::Adaptor;
use crate::command::{CommandManager, NodeAccess};
use crate::guid::ROUTER_GUID;
use crate::node::{self, Node, NodeCore, Transmitter};
use crate::opcode;
use crate::packet::{Flags, Packet, BROADCAST_ADDRESS, MASTER_ADDRESS, UNASSIGNED_ADDRESS};
use crate::transaction::{CommandFlags, IncomingTransaction, OutgoingTransaction, ResponseCode};
use idp_support::logging::{self, Logger};
use idp_support::NetworkConfig;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct RouterInner {
    core: NodeCore,
    commands: Option<CommandManager<RouterInner>>,
    unenumerated_nodes: VecDeque<Node>,
    enumerated_nodes: IndexMap<u16, Node>,
    adaptors: IndexMap<u16, Box<dyn Adaptor>>,
    routing_table: IndexMap<u16, u16>,
    currently_enumerating_adaptor: Option<u16>,
    next_adaptor_id: u16,
    has_uplink: bool,
    last_now: u64,
    /// Replies a command handler builds itself (stamped with a newly adopted
    /// address) instead of letting `CommandManager` seal one automatically.
    /// Drained by `process_locally` and routed exactly like any other reply.
    pending_deferred: Vec<Packet>,
    log: Logger,
}

impl NodeAccess for RouterInner {
    fn node(&self) -> &NodeCore {
        &self.core
    }
    fn node_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    /// A router's reset re-homes every enumerated node back to the unenumerated
    /// pool and clears adaptor enumeration flags; it does not, unlike a plain
    /// node, give up its own address.
    fn on_reset(&mut self) {
        let stale: Vec<u16> = self.enumerated_nodes.keys().copied().filter(|&a| a != MASTER_ADDRESS).collect();
        for addr in stale {
            if let Some(mut node) = self.enumerated_nodes.shift_remove(&addr) {
                node.core.clear_address();
                self.unenumerated_nodes.push_front(node);
            }
        }
        for adaptor in self.adaptors.values_mut() {
            adaptor.set_enumerated(false);
            adaptor.set_re_enumerated(false);
        }
    }
}

impl RouterInner {
    fn with_commands<R>(&mut self, f: impl FnOnce(&mut RouterInner, &mut CommandManager<RouterInner>) -> R) -> R {
        let mut commands = self.commands.take().expect("commands is always present between calls");
        let result = f(self, &mut commands);
        self.commands = Some(commands);
        result
    }

    /// Runs one packet through this router's own command dispatch, returning
    /// every reply that needs routing back out: the automatic response (if
    /// any) plus whatever deferred replies the handler stashed.
    fn process_locally(&mut self, now: u64, packet: Packet) -> Vec<Packet> {
        let auto_reply = self.with_commands(|ctx, commands| match commands.process_payload(ctx, now, packet) {
            Ok(reply) => reply,
            Err(err) => {
                logging::debug!(ctx.log, "router dropped malformed packet"; "error" => %err);
                None
            }
        });

        let mut replies: Vec<Packet> = self.pending_deferred.drain(..).collect();
        replies.extend(auto_reply);
        replies
    }
}

fn register_router_commands(commands: &mut CommandManager<RouterInner>) {
    commands.register_command_handler(
        opcode::ROUTER_DETECT,
        Box::new(|ctx, _mgr, now, incoming, outgoing| {
            let addr = incoming.read::<u16>();

            if ctx.node().address() == UNASSIGNED_ADDRESS {
                ctx.node_mut().set_address(addr, now);
                let mut reply = OutgoingTransaction::create_response(incoming.txid(), ResponseCode::Ok, opcode::ROUTER_DETECT);
                reply.write(true);
                let packet = reply.to_packet(addr, incoming.source(), Flags::NONE);
                ctx.pending_deferred.push(packet);
                ResponseCode::Deferred
            } else {
                outgoing.write(false);
                ResponseCode::Ok
            }
        }),
    );

    commands.register_command_handler(
        opcode::ROUTER_ENUMERATE_NODE,
        Box::new(|ctx, _mgr, now, incoming, outgoing| {
            let addr = incoming.read::<u16>();

            match ctx.unenumerated_nodes.pop_back() {
                Some(mut node) => {
                    node.set_address(addr, now);
                    ctx.enumerated_nodes.insert(addr, node);

                    let mut reply =
                        OutgoingTransaction::create_response(incoming.txid(), ResponseCode::Ok, opcode::ROUTER_ENUMERATE_NODE);
                    reply.write(true);
                    let packet = reply.to_packet(addr, incoming.source(), Flags::NONE);
                    ctx.pending_deferred.push(packet);
                    ResponseCode::Deferred
                }
                None => {
                    outgoing.write(false);
                    ResponseCode::Ok
                }
            }
        }),
    );

    commands.register_command_handler(
        opcode::ROUTER_PREPARE_TO_ENUMERATE_ADAPTORS,
        Box::new(|ctx, _mgr, _now, _incoming, _outgoing| {
            for adaptor in ctx.adaptors.values_mut() {
                adaptor.set_re_enumerated(false);
            }
            ResponseCode::Ok
        }),
    );

    commands.register_command_handler(
        opcode::ROUTER_ENUMERATE_ADAPTOR,
        Box::new(|ctx, _mgr, _now, incoming, outgoing| {
            let addr = incoming.read::<u16>();
            let proxy_txid = incoming.read::<u32>();

            let candidate = ctx.adaptors.iter().find(|(_, a)| !a.is_re_enumerated()).map(|(id, _)| *id);

            match candidate {
                Some(id) => {
                    let adaptor = ctx.adaptors.get_mut(&id).expect("id came from this map");
                    adaptor.set_re_enumerated(true);
                    let probed = !adaptor.is_enumerated();

                    if probed {
                        ctx.currently_enumerating_adaptor = Some(id);
                        let mut detect = OutgoingTransaction::create(opcode::ROUTER_DETECT, proxy_txid, CommandFlags::RESPONSE_EXPECTED);
                        detect.write(addr);
                        // Source is stamped as the master's own address, not this router's,
                        // so the newly-detected router's reply carries destination ==
                        // MASTER_ADDRESS and routes all the way back to where `proxy_txid`
                        // is actually registered (the master's transaction table), rather
                        // than terminating at this router's own command manager.
                        let packet = detect.to_packet(MASTER_ADDRESS, UNASSIGNED_ADDRESS, Flags::NONE);
                        adaptor.transmit(packet);
                    }

                    outgoing.write(true);
                    outgoing.write(probed);
                }
                None => {
                    outgoing.write(false);
                    outgoing.write(false);
                }
            }

            ResponseCode::Ok
        }),
    );

    commands.register_command_handler(
        opcode::MARK_ADAPTOR_CONNECTED,
        Box::new(|ctx, _mgr, _now, _incoming, _outgoing| {
            if let Some(id) = ctx.currently_enumerating_adaptor.take() {
                if let Some(adaptor) = ctx.adaptors.get_mut(&id) {
                    adaptor.set_enumerated(true);
                }
            }
            ResponseCode::Ok
        }),
    );

    // Overrides the generic builtin handler: a router has no single transmit
    // endpoint that reaches every address it might be replying to, so its
    // deferred replies go through `pending_deferred` and get routed by
    // `process_locally` instead of a raw `node_mut().transmit()` call.
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

            let mut reply = OutgoingTransaction::create_response(incoming.txid(), ResponseCode::Ok, opcode::QUERY_INTERFACE);
            let guid = ctx.node().guid();
            reply.write_guid(&guid);
            let own_address = ctx.node().address();
            let packet = reply.to_packet(own_address, incoming.source(), Flags::NONE);
            ctx.pending_deferred.push(packet);
            ResponseCode::Deferred
        }),
    );
}

/// Cheap, cloneable handle to a router. A router is its own transmit endpoint (its
/// child nodes and its adaptors both route through it), which is the one place in
/// this crate where shared mutable ownership is unavoidable.
#[derive(Clone)]
pub struct Router(Rc<RefCell<RouterInner>>);

impl Router {
    pub fn new(config: &NetworkConfig, log: Logger) -> Router {
        let core = NodeCore::new(ROUTER_GUID, "Network.Router", config);
        let mut commands = CommandManager::new(config.transaction_timeout_ms, log.new(logging::o!()));
        node::register_builtin_commands(&mut commands);
        register_router_commands(&mut commands);

        let inner = RouterInner {
            core,
            commands: Some(commands),
            unenumerated_nodes: VecDeque::new(),
            enumerated_nodes: IndexMap::new(),
            adaptors: IndexMap::new(),
            routing_table: IndexMap::new(),
            currently_enumerating_adaptor: None,
            next_adaptor_id: 1,
            has_uplink: false,
            last_now: 0,
            pending_deferred: Vec::new(),
            log,
        };

        Router(Rc::new(RefCell::new(inner)))
    }

    pub fn address(&self) -> u16 {
        self.0.borrow().core.address()
    }

    pub fn add_node(&self, mut node: Node) {
        node.attach_transmit(Box::new(self.clone()));
        self.0.borrow_mut().unenumerated_nodes.push_front(node);
    }

    pub fn has_node(&self, addr: u16) -> bool {
        self.0.borrow().enumerated_nodes.contains_key(&addr)
    }

    pub fn pending_node_count(&self) -> usize {
        self.0.borrow().unenumerated_nodes.len()
    }

    pub fn add_adaptor(&self, mut adaptor: Box<dyn Adaptor>) -> u16 {
        let mut inner = self.0.borrow_mut();
        let id = inner.next_adaptor_id;
        inner.next_adaptor_id += 1;
        adaptor.set_adaptor_id(id);
        inner.adaptors.insert(id, adaptor);
        id
    }

    pub fn with_adaptor_mut(&self, id: u16, f: impl FnOnce(&mut Box<dyn Adaptor>)) {
        let mut inner = self.0.borrow_mut();
        if let Some(adaptor) = inner.adaptors.get_mut(&id) {
            f(adaptor);
        }
    }

    pub fn set_adaptor_active(&self, id: u16, active: bool) {
        self.with_adaptor_mut(id, |adaptor| adaptor.set_active(active));
    }

    pub fn adaptor_is_enumerated(&self, id: u16) -> bool {
        self.0.borrow().adaptors.get(&id).map_or(false, |a| a.is_enumerated())
    }

    pub fn adaptor_is_re_enumerated(&self, id: u16) -> bool {
        self.0.borrow().adaptors.get(&id).map_or(false, |a| a.is_re_enumerated())
    }

    /// Entry point for a packet arriving from a peer over `adaptor_id`.
    pub fn receive_from_adaptor(&self, adaptor_id: u16, packet: Packet) {
        self.route(Some(adaptor_id), packet);
    }

    /// Wires this router's upward link, i.e. whatever it is itself attached
    /// to - the master, for a root router. Only a root router ever has one;
    /// `route` uses its presence to resolve `destination == MASTER_ADDRESS`,
    /// which never appears in `routing_table` since packets from the master
    /// arrive directly rather than via an adaptor.
    pub fn attach_uplink(&self, transmitter: Box<dyn Transmitter>) {
        let mut inner = self.0.borrow_mut();
        inner.core.set_transmit(transmitter);
        inner.has_uplink = true;
    }

    /// Advances the router's own command-timeout reaping, self-liveness (if it is
    /// itself addressed and not the master), and polls any stream-backed adaptors.
    pub fn tick(&self, now: u64) {
        let mut inner = self.0.borrow_mut();
        inner.last_now = now;
        inner.with_commands(|ctx, commands| {
            node::tick_liveness(ctx, commands, now);
            commands.invalidate_timeouts(ctx, now);
        });
    }

    fn route(&self, via_adaptor: Option<u16>, packet: Packet) {
        let source = packet.source();
        let destination = packet.destination();
        let now = self.0.borrow().last_now;

        if let Some(adaptor_id) = via_adaptor {
            let mut inner = self.0.borrow_mut();
            if source != UNASSIGNED_ADDRESS {
                let master_route_taken = inner.routing_table.contains_key(&MASTER_ADDRESS);
                if !(source == MASTER_ADDRESS && master_route_taken) {
                    inner.routing_table.insert(source, adaptor_id);
                }
                if let Some(adaptor) = inner.adaptors.get_mut(&adaptor_id) {
                    adaptor.set_enumerated(true);
                }
            }
        }

        if destination == BROADCAST_ADDRESS {
            let mut replies = Vec::new();

            {
                let mut inner = self.0.borrow_mut();
                let adaptor_ids: Vec<u16> = inner.adaptors.keys().copied().collect();
                for id in adaptor_ids {
                    if Some(id) == via_adaptor {
                        continue;
                    }
                    if let Some(adaptor) = inner.adaptors.get_mut(&id) {
                        adaptor.transmit(packet.clone());
                    }
                }

                let addrs: Vec<u16> = inner.enumerated_nodes.keys().copied().collect();
                for addr in addrs {
                    if let Some(node) = inner.enumerated_nodes.get_mut(&addr) {
                        if let Some(reply) = node.handle_packet(now, packet.clone()) {
                            replies.push(reply);
                        }
                    }
                }
            }

            replies.extend(self.0.borrow_mut().process_locally(now, packet));

            for reply in replies {
                self.route(None, reply);
            }
            return;
        }

        let own_address = self.0.borrow().core.address();

        if destination == own_address {
            let replies = self.0.borrow_mut().process_locally(now, packet);
            for reply in replies {
                self.route(None, reply);
            }
            return;
        }

        if destination == MASTER_ADDRESS {
            let mut inner = self.0.borrow_mut();
            if inner.has_uplink {
                if !inner.core.transmit(packet) {
                    logging::debug!(inner.log, "uplink transmit failed"; "destination" => destination);
                }
                return;
            }
        }

        let locally_enumerated = {
            let mut inner = self.0.borrow_mut();
            if let Some(node) = inner.enumerated_nodes.get_mut(&destination) {
                Some(node.handle_packet(now, packet.clone()))
            } else {
                None
            }
        };

        if let Some(reply) = locally_enumerated {
            if let Some(reply) = reply {
                self.route(None, reply);
            }
            return;
        }

        let route_adaptor = self.0.borrow().routing_table.get(&destination).copied();
        match route_adaptor {
            Some(adaptor_id) => {
                let mut inner = self.0.borrow_mut();
                if let Some(adaptor) = inner.adaptors.get_mut(&adaptor_id) {
                    adaptor.transmit(packet);
                }
            }
            None => {
                let inner = self.0.borrow();
                logging::debug!(inner.log, "unknown route"; "destination" => destination);
            }
        }
    }
}

impl Transmitter for Router {
    fn transmit(&mut self, packet: Packet) -> bool {
        self.route(None, packet);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::link_routers;
    use crate::guid::Guid;
    use idp_support::logging;

    fn router() -> Router {
        Router::new(&NetworkConfig::default(), logging::discard())
    }

    fn child(guid: Guid, name: &str) -> Node {
        Node::new(guid, name, &NetworkConfig::default(), logging::discard())
    }

    #[test]
    fn pending_nodes_are_fifo() {
        let r = router();
        r.add_node(child(Guid::from_fields(1, 0, 0, [0; 8]), "a"));
        r.add_node(child(Guid::from_fields(2, 0, 0, [0; 8]), "b"));
        assert_eq!(r.pending_node_count(), 2);
    }

    #[test]
    fn linked_routers_exchange_broadcast() {
        let mut a = router();
        let b = router();
        link_routers(&a, &b);
        a.add_node(child(Guid::from_fields(1, 0, 0, [0; 8]), "a-child"));
        b.add_node(child(Guid::from_fields(2, 0, 0, [0; 8]), "b-child"));

        assert!(!a.adaptor_is_enumerated(1));
        assert!(!b.adaptor_is_enumerated(1));

        // Source 5 stands in for some address already known to the network; a
        // packet arriving with an unassigned source never marks an adaptor
        // enumerated, since the far side hasn't joined the tree yet.
        let ping = OutgoingTransaction::create(opcode::PING, 1, CommandFlags::NONE);
        let packet = ping.to_packet(5, BROADCAST_ADDRESS, Flags::NONE);
        Transmitter::transmit(&mut a, packet);

        // `a` originated the broadcast locally (no via_adaptor), so its own
        // adaptor bookkeeping is untouched; `b` received it over adaptor 1 and
        // marks that adaptor enumerated.
        assert!(!a.adaptor_is_enumerated(1));
        assert!(b.adaptor_is_enumerated(1));
    }
}
