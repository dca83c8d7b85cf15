pub mod abi;
pub mod bridge;
pub mod config;
pub mod fault;
pub mod harness;
pub mod logging;
pub mod marshal;
pub mod registry;
pub mod scripts;
pub mod sequencer;
pub mod syscall;

pub use bridge::{BridgeContext, BridgeState};
pub use config::BridgeConfig;
pub use fault::{BridgeFault, FaultClass};
pub use marshal::DispatchEvent;
pub use registry::{DispatchTarget, TargetReply};
pub use scripts::RhaiRuntime;
pub use sequencer::{initialize, EntryPoint, Registration};
pub use syscall::{SyscallFn, SyscallPort, SyscallSink};
