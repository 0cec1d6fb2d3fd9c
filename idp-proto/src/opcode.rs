//! Well-known 16-bit command opcodes. Protocol-internal commands live in the
//! `0xA0xx` range; client-facing commands (outside the core, kept for completeness)
//! live in `0xD0xx`.

pub const RESPONSE: u16 = 0xA000;
pub const PING: u16 = 0xA001;
pub const GET_NODE_INFO: u16 = 0xA002;
pub const QUERY_INTERFACE: u16 = 0xA003;
pub const RESET: u16 = 0xA004;
pub const RECOMMEND_ENUMERATION: u16 = 0xA005;
pub const ROUTER_DETECT: u16 = 0xA006;
pub const ROUTER_ENUMERATE_NODE: u16 = 0xA007;
pub const ROUTER_PREPARE_TO_ENUMERATE_ADAPTORS: u16 = 0xA008;
pub const ROUTER_ENUMERATE_ADAPTOR: u16 = 0xA009;
pub const MARK_ADAPTOR_CONNECTED: u16 = 0xA00A;
pub const ROUTER_POLL: u16 = 0xA00B;

pub const CONNECT: u16 = 0xD000;
pub const DISCONNECT: u16 = 0xD001;
