use crate::node::NodeCore;
use crate::opcode;
use crate::packet::{Flags, Packet};
use crate::transaction::{CommandFlags, IncomingTransaction, OutgoingTransaction, ResponseCode};
use idp_support::logging::{self, Logger};
use idp_support::IdpResult;
use indexmap::IndexMap;

/// The capability a [`CommandManager`] needs from its owning type: access to the
/// node identity it dispatches on behalf of, and a hook for `Reset`. Stands in for
/// the virtual `OnReset` override the source used; `Router` and `Master` each give
/// their own behavior by overriding the default.
pub trait NodeAccess {
    fn node(&self) -> &NodeCore;
    fn node_mut(&mut self) -> &mut NodeCore;

    fn on_reset(&mut self) {
        self.node_mut().clear_address();
    }
}

pub enum ResponseOutcome<'a> {
    Received(ResponseCode, &'a mut IncomingTransaction),
    TimedOut,
}

pub type CommandHandler<C> =
    Box<dyn FnMut(&mut C, &mut CommandManager<C>, u64, &mut IncomingTransaction, &mut OutgoingTransaction) -> ResponseCode>;
pub type ResponseHandler<C> = Box<dyn FnMut(&mut C, &mut CommandManager<C>, u64, ResponseOutcome)>;

struct PendingTransaction<C> {
    handler: ResponseHandler<C>,
    expiry: u64,
}

/// Command-handler table, persistent response-handler table, and one-shot
/// transaction-handler table, with timeout-based reaping. Generic over the owning
/// node's context type so handlers borrow it explicitly rather than through a
/// self-captured closure.
pub struct CommandManager<C> {
    command_handlers: IndexMap<u16, CommandHandler<C>>,
    response_handlers: IndexMap<u16, ResponseHandler<C>>,
    transaction_handlers: IndexMap<u32, PendingTransaction<C>>,
    timeout_ms: u64,
    log: Logger,
}

impl<C: NodeAccess> CommandManager<C> {
    pub fn new(timeout_ms: u64, log: Logger) -> CommandManager<C> {
        CommandManager {
            command_handlers: IndexMap::new(),
            response_handlers: IndexMap::new(),
            transaction_handlers: IndexMap::new(),
            timeout_ms,
            log,
        }
    }

    pub fn register_command_handler(&mut self, cmd: u16, handler: CommandHandler<C>) {
        self.command_handlers.insert(cmd, handler);
    }

    pub fn unregister_command_handler(&mut self, cmd: u16) {
        self.command_handlers.remove(&cmd);
    }

    /// Persistent handler invoked every time a `Response` for `original_cmd` arrives
    /// and no one-shot transaction handler claimed it first.
    pub fn register_response_handler(&mut self, original_cmd: u16, handler: ResponseHandler<C>) {
        self.response_handlers.insert(original_cmd, handler);
    }

    /// One-shot handler invoked the next time a `Response` carrying this `txid`
    /// arrives, or when it times out - whichever comes first.
    pub fn register_one_time_response_handler(&mut self, txid: u32, now: u64, handler: ResponseHandler<C>) {
        let expiry = now + self.timeout_ms;
        self.transaction_handlers.insert(txid, PendingTransaction { handler, expiry });
    }

    pub fn unregister_one_time_response_handler(&mut self, txid: u32) {
        self.transaction_handlers.remove(&txid);
    }

    pub fn has_one_time_response_handler(&self, txid: u32) -> bool {
        self.transaction_handlers.contains_key(&txid)
    }

    /// Runs one inbound packet's command payload through dispatch, returning the
    /// reply packet to transmit back to `incoming.source()`, if any.
    pub fn process_payload(&mut self, ctx: &mut C, now: u64, packet: Packet) -> IdpResult<Option<Packet>> {
        let mut incoming = IncomingTransaction::from_packet(packet)?;

        if incoming.cmd() == opcode::RESPONSE {
            self.handle_response(ctx, now, &mut incoming);
            return Ok(None);
        }

        let own_address = ctx.node().address();

        if let Some(mut handler) = self.command_handlers.remove(&incoming.cmd()) {
            let mut outgoing = OutgoingTransaction::create_response(incoming.txid(), ResponseCode::Ok, incoming.cmd());
            let rc = handler(ctx, self, now, &mut incoming, &mut outgoing);
            self.command_handlers.insert(incoming.cmd(), handler);

            if incoming.response_expected() && !matches!(rc, ResponseCode::Deferred) {
                outgoing.with_response_code(rc);
                Ok(Some(outgoing.to_packet(own_address, incoming.source(), Flags::NONE)))
            } else {
                Ok(None)
            }
        } else {
            logging::debug!(self.log, "unknown command"; "cmd" => incoming.cmd());
            let outgoing =
                OutgoingTransaction::create_response(incoming.txid(), ResponseCode::UnknownCommand, incoming.cmd());
            Ok(Some(outgoing.to_packet(own_address, incoming.source(), Flags::NONE)))
        }
    }

    fn handle_response(&mut self, ctx: &mut C, now: u64, incoming: &mut IncomingTransaction) {
        let code = ResponseCode::from_u8(incoming.read::<u8>());
        let original_cmd = incoming.read::<u16>();

        if let Some(pending) = self.transaction_handlers.remove(&incoming.txid()) {
            let mut handler = pending.handler;
            handler(ctx, self, now, ResponseOutcome::Received(code, incoming));
            return;
        }

        if let Some(mut handler) = self.response_handlers.remove(&original_cmd) {
            handler(ctx, self, now, ResponseOutcome::Received(code, incoming));
            self.response_handlers.insert(original_cmd, handler);
        }
    }

    /// Reaps every one-shot transaction handler whose deadline has passed, invoking
    /// each with [`ResponseOutcome::TimedOut`] exactly once.
    pub fn invalidate_timeouts(&mut self, ctx: &mut C, now: u64) {
        let expired: Vec<u32> = self
            .transaction_handlers
            .iter()
            .filter(|(_, pending)| pending.expiry < now)
            .map(|(txid, _)| *txid)
            .collect();

        for txid in expired {
            if let Some(pending) = self.transaction_handlers.remove(&txid) {
                let mut handler = pending.handler;
                logging::debug!(self.log, "transaction timed out"; "txid" => txid);
                handler(ctx, self, now, ResponseOutcome::TimedOut);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeCore;
    use crate::packet::Flags;
    use idp_support::logging;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Ctx {
        node: NodeCore,
    }

    impl NodeAccess for Ctx {
        fn node(&self) -> &NodeCore {
            &self.node
        }
        fn node_mut(&mut self) -> &mut NodeCore {
            &mut self.node
        }
    }

    fn ctx() -> Ctx {
        let config = idp_support::NetworkConfig::default();
        Ctx { node: NodeCore::new(crate::guid::MASTER_GUID, "test", &config) }
    }

    fn command_packet(cmd: u16, txid: u32, flags: CommandFlags) -> Packet {
        let tx = OutgoingTransaction::create(cmd, txid, flags);
        tx.to_packet(2, 1, Flags::NONE)
    }

    #[test]
    fn unknown_command_always_replies() {
        let mut manager: CommandManager<Ctx> = CommandManager::new(1_750, logging::discard());
        let mut c = ctx();

        let reply = manager.process_payload(&mut c, 0, command_packet(opcode::PING, 1, CommandFlags::NONE)).unwrap();
        let mut incoming = IncomingTransaction::from_packet(reply.expect("unknown command always replies")).unwrap();
        assert_eq!(incoming.cmd(), opcode::RESPONSE);
        assert_eq!(incoming.read::<u8>(), ResponseCode::UnknownCommand as u8);
        assert_eq!(incoming.read::<u16>(), opcode::PING);
    }

    #[test]
    fn known_command_without_response_expected_replies_nothing() {
        let mut manager: CommandManager<Ctx> = CommandManager::new(1_750, logging::discard());
        manager.register_command_handler(
            opcode::PING,
            Box::new(|_ctx, _mgr, _now, _incoming, _outgoing| ResponseCode::Ok),
        );
        let mut c = ctx();

        let reply = manager.process_payload(&mut c, 0, command_packet(opcode::PING, 1, CommandFlags::NONE)).unwrap();
        assert!(reply.is_none());
    }

    #[test]
    fn deferred_response_suppresses_automatic_reply() {
        let mut manager: CommandManager<Ctx> = CommandManager::new(1_750, logging::discard());
        manager.register_command_handler(
            opcode::QUERY_INTERFACE,
            Box::new(|_ctx, _mgr, _now, _incoming, _outgoing| ResponseCode::Deferred),
        );
        let mut c = ctx();

        let packet = command_packet(opcode::QUERY_INTERFACE, 1, CommandFlags::RESPONSE_EXPECTED);
        let reply = manager.process_payload(&mut c, 0, packet).unwrap();
        assert!(reply.is_none());
    }

    #[test]
    fn one_time_response_handler_fires_on_matching_txid() {
        let mut manager: CommandManager<Ctx> = CommandManager::new(1_750, logging::discard());
        let mut c = ctx();

        let seen = Rc::new(RefCell::new(false));
        let seen_clone = seen.clone();
        manager.register_one_time_response_handler(
            7,
            0,
            Box::new(move |_ctx, _mgr, _now, outcome| {
                if let ResponseOutcome::Received(_, _) = outcome {
                    *seen_clone.borrow_mut() = true;
                }
            }),
        );

        let mut response = OutgoingTransaction::create(opcode::RESPONSE, 7, CommandFlags::NONE);
        response.write(ResponseCode::Ok as u8);
        response.write(opcode::PING);
        let packet = response.to_packet(2, 1, Flags::NONE);

        manager.process_payload(&mut c, 0, packet).unwrap();
        assert!(*seen.borrow());
        assert!(!manager.has_one_time_response_handler(7));
    }

    #[test]
    fn timed_out_transaction_handler_is_invoked_once() {
        let mut manager: CommandManager<Ctx> = CommandManager::new(100, logging::discard());
        let mut c = ctx();

        let fired = Rc::new(RefCell::new(0));
        let fired_clone = fired.clone();
        manager.register_one_time_response_handler(
            1,
            0,
            Box::new(move |_ctx, _mgr, _now, outcome| {
                if let ResponseOutcome::TimedOut = outcome {
                    *fired_clone.borrow_mut() += 1;
                }
            }),
        );

        manager.invalidate_timeouts(&mut c, 50);
        assert_eq!(*fired.borrow(), 0);

        manager.invalidate_timeouts(&mut c, 200);
        assert_eq!(*fired.borrow(), 1);
        assert!(!manager.has_one_time_response_handler(1));
    }
}
