// nbd/mod.rs
//
// NBD data plane on the hub: the TCP port pool handed to qemu-nbd servers,
// the qemu-nbd process manager, the client-device pool used by restore, and
// export naming.

pub mod client;
pub mod devices;
pub mod export;
pub mod ports;
pub mod server;

pub use devices::DevicePool;
pub use ports::PortAllocator;
pub use server::QemuNbdManager;

use thiserror::Error;

use crate::tools::ToolError;

#[derive(Error, Debug)]
pub enum NbdError {
    #[error("NBD port pool exhausted")]
    PortsExhausted,

    #[error("NBD device pool exhausted")]
    DevicesExhausted,

    #[error("port {0} already has a live qemu-nbd server")]
    PortBusy(u16),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("failed to spawn qemu-nbd: {0}")]
    Spawn(std::io::Error),
}
