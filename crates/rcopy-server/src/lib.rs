/// rcopy listener: accepts connections and installs the files they carry.
///
/// - Connection dispatcher handing accepted sockets to workers in arrival order
/// - IP allow masks checked before the handshake
/// - Output tree mapping wire names to paths under `--out-dir`
/// - Accept loop with cancellation and tracked per-connection workers

pub mod allow;
pub mod destination;
pub mod dispatcher;
pub mod listener;

pub use allow::{ConfigError, IpAllow, IpMask};
pub use destination::OutputTree;
pub use dispatcher::{ConnectionDispatcher, ConnectionSlot};
pub use listener::{ServerConfig, serve};
