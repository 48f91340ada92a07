//! Kiln Remote - out-of-process command execution
//!
//! Features:
//! - Per-command HTTP channel on the loopback interface
//! - Worker processes launched from the running executable
//! - Ordered log forwarding from worker to master
//! - Exactly-once result registration with a timeout

pub mod error;
pub mod launcher;
pub mod master;
pub mod protocol;
pub mod slave;

pub use error::RemoteError;
pub use launcher::{ProcessLauncher, WorkerFuture, WorkerLauncher};
pub use master::{run_channel, ChannelServer, RemoteMaster};
pub use protocol::{ForwardedLog, WorkerRequest};
pub use slave::{run_slave, ChannelClient, RemoteLogForwarder, SlaveOptions};
