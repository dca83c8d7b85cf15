use std::cell::RefCell;
use std::rc::Rc;

use crate::fault::BridgeFault;
use crate::marshal::{pack_syscall_args, SYSCALL_ARG_SLOTS};

/// The engine's syscall trampoline: a syscall number followed by up to
/// [`SYSCALL_ARG_SLOTS`] integer-sized arguments.
pub type SyscallFn = unsafe extern "C" fn(number: isize, ...) -> isize;

/// Receiver of outbound syscalls, already laid out in the engine's fixed slots.
pub trait SyscallSink {
    fn call(&self, number: isize, args: &[isize; SYSCALL_ARG_SLOTS]) -> isize;
}

/// The engine-provided syscall pointer. The engine owns it for the whole process lifetime.
#[derive(Clone, Copy)]
pub struct EngineSyscall(SyscallFn);

impl EngineSyscall {
    pub fn new(raw: SyscallFn) -> Self {
        Self(raw)
    }
}

impl SyscallSink for EngineSyscall {
    fn call(&self, number: isize, args: &[isize; SYSCALL_ARG_SLOTS]) -> isize {
        let a = args;
        // All slots are passed so the engine never reads an undefined vararg.
        unsafe {
            (self.0)(
                number, a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8], a[9], a[10], a[11], a[12], a[13],
                a[14],
            )
        }
    }
}

/// Shared slot holding the installed syscall sink.
#[derive(Clone, Default)]
pub struct SyscallPort(Rc<RefCell<Option<Rc<dyn SyscallSink>>>>);

impl SyscallPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, sink: Rc<dyn SyscallSink>) {
        *self.0.borrow_mut() = Some(sink);
    }

    pub fn is_installed(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().take();
    }

    /// Forwards a syscall, padding or truncating `args` to the engine's fixed arity.
    pub fn syscall(&self, number: isize, args: &[isize]) -> Result<isize, BridgeFault> {
        // Clone the handle out so the engine may re-enter the bridge from inside the call.
        let sink = self.0.borrow().clone().ok_or(BridgeFault::SyscallUnavailable)?;
        let slots = pack_syscall_args(args);
        log::trace!("syscall {number} {slots:?}");
        Ok(sink.call(number, &slots))
    }
}
