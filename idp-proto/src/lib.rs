pub mod adaptor;
pub mod command;
pub mod guid;
pub mod master;
pub mod node;
pub mod opcode;
pub mod packet;
pub mod parser;
pub mod router;
pub mod stream;
pub mod transaction;

pub use adaptor::{Adaptor, NotifyingStreamAdaptor, SimpleAdaptor};
pub use command::{CommandHandler, CommandManager, NodeAccess, ResponseHandler, ResponseOutcome};
pub use guid::Guid;
pub use master::Master;
pub use node::{Node, NodeCore, Transmitter};
pub use packet::{Flags, Packet};
pub use parser::PacketParser;
pub use router::Router;
pub use stream::Stream;
pub use transaction::{CommandFlags, IncomingTransaction, OutgoingTransaction, ResponseCode};
