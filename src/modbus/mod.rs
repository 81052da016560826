// ModBus RTU pieces needed to follow somebody else's conversation on the bus.
pub mod crc;
pub mod frame;
pub mod parser;

pub use parser::{ParserState, ParserStats, TransactionContext, TransactionParser};
