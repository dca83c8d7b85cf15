use crate::fault::BridgeFault;
use crate::marshal::{narrow_result, DispatchEvent};
use crate::registry::{RegistryHandle, TargetReply};
use crate::syscall::SyscallPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No dispatch target registered; every dispatch is a fault.
    Uninitialized,
    Ready,
}

/// The two pieces of process-wide state: the dispatch target slot and the engine's syscall
/// pointer. Cloning yields another handle to the same slots.
#[derive(Clone, Default)]
pub struct BridgeContext {
    pub registry: RegistryHandle,
    pub syscalls: SyscallPort,
}

impl BridgeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BridgeState {
        if self.registry.is_ready() {
            BridgeState::Ready
        } else {
            BridgeState::Uninitialized
        }
    }

    /// Forwards one engine event to the current dispatch target.
    pub fn dispatch(&self, event: &DispatchEvent) -> Result<isize, BridgeFault> {
        // The registry borrow ends here, so the target may re-enter the bridge.
        let target = self.registry.current().ok_or(BridgeFault::TargetUnset)?;
        let command = event.command;
        let reply = target
            .invoke(event)
            .map_err(|err| BridgeFault::TargetFailed { command, reason: format!("{err:#}") })?;
        match reply {
            TargetReply::Integer(value) => {
                narrow_result(value).ok_or(BridgeFault::TargetResultRange { command, value })
            }
            TargetReply::Other { type_name } => Err(BridgeFault::TargetResultType { command, type_name }),
        }
    }

    /// Releases the dispatch target and forgets the syscall pointer.
    pub fn teardown(&self) {
        self.registry.clear();
        self.syscalls.clear();
    }
}
