//! Argument marshalling between the engine's fixed-arity calls and variable-length
//! argument lists.
//!
//! Inbound, the engine always passes a command plus [`VM_DISPATCH_ARGS`] integers, whatever
//! the real arity of the event is. Outbound, the engine's syscall entry reads exactly
//! [`SYSCALL_ARG_SLOTS`] integers after the syscall number.
//!
//! # Known limitation
//!
//! Outbound calls with more than [`SYSCALL_ARG_SLOTS`] arguments lose the excess arguments
//! without any error. The engine's syscall trampoline never reads past that count, so there
//! is nothing the bridge could forward them to.
//!
//! Rhai native functions take at most 20 parameters, so the script-side `syscall` accepts a
//! number plus up to 19 arguments. Longer lists have to go through `vsyscall`, which takes an
//! array of any length and truncates it the same way.

use std::os::raw::c_int;

/// Trailing integers the engine passes to `vmMain` after the command.
pub const VM_DISPATCH_ARGS: usize = 12;

/// Length of the marshalled dispatch argument list: the command followed by its arguments.
pub const DISPATCH_SLOTS: usize = VM_DISPATCH_ARGS + 1;

/// Maximum number of integers (syscall number included) the engine reads per syscall.
pub const MAX_VMSYSCALL_ARGS: usize = 16;

/// Argument slots following the syscall number.
pub const SYSCALL_ARG_SLOTS: usize = MAX_VMSYSCALL_ARGS - 1;

/// One engine dispatch call, alive for the duration of that call only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchEvent {
    pub command: c_int,
    pub args: [c_int; VM_DISPATCH_ARGS],
}

impl DispatchEvent {
    pub fn new(command: c_int, args: [c_int; VM_DISPATCH_ARGS]) -> Self {
        Self { command, args }
    }

    /// Builds an event from a shorter argument list, zero-filling the unused slots.
    pub fn from_partial(command: c_int, args: &[c_int]) -> Self {
        let mut slots = [0; VM_DISPATCH_ARGS];
        for (slot, value) in slots.iter_mut().zip(args) {
            *slot = *value;
        }
        Self { command, args: slots }
    }

    /// `[command, arg0, ..., arg11]` in call order.
    pub fn arguments(&self) -> [c_int; DISPATCH_SLOTS] {
        let mut packed = [0; DISPATCH_SLOTS];
        packed[0] = self.command;
        packed[1..].copy_from_slice(&self.args);
        packed
    }
}

/// Lays out a variable-length syscall argument list in the engine's fixed slots.
///
/// Missing trailing slots are zero; anything past [`SYSCALL_ARG_SLOTS`] is dropped.
pub fn pack_syscall_args(args: &[isize]) -> [isize; SYSCALL_ARG_SLOTS] {
    let mut slots = [0isize; SYSCALL_ARG_SLOTS];
    let used = args.len().min(SYSCALL_ARG_SLOTS);
    slots[..used].copy_from_slice(&args[..used]);
    slots
}

/// Converts a script integer to the engine's `intptr_t` return type.
///
/// Returns `None` when the value does not fit; callers treat that as a broken result
/// contract rather than wrapping.
pub fn narrow_result(value: i64) -> Option<isize> {
    isize::try_from(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_arguments_lead_with_the_command() {
        let args = [1, -2, 3, -4, 5, -6, 7, -8, 9, -10, 11, -12];
        let event = DispatchEvent::new(42, args);
        let packed = event.arguments();
        assert_eq!(packed.len(), DISPATCH_SLOTS);
        assert_eq!(packed[0], 42);
        assert_eq!(&packed[1..], &args);
    }

    #[test]
    fn dispatch_arguments_keep_extreme_values() {
        let mut args = [0; VM_DISPATCH_ARGS];
        args[0] = c_int::MIN;
        args[11] = c_int::MAX;
        args[5] = -1;
        let packed = DispatchEvent::new(c_int::MIN, args).arguments();
        assert_eq!(packed[0], c_int::MIN);
        assert_eq!(packed[1], c_int::MIN);
        assert_eq!(packed[6], -1);
        assert_eq!(packed[12], c_int::MAX);
    }

    #[test]
    fn partial_events_are_zero_filled() {
        let event = DispatchEvent::from_partial(7, &[9, 8]);
        assert_eq!(event.args[..2], [9, 8]);
        assert!(event.args[2..].iter().all(|value| *value == 0));
    }

    #[test]
    fn short_syscalls_are_zero_padded() {
        let slots = pack_syscall_args(&[5, -6, 7]);
        assert_eq!(slots[..3], [5, -6, 7]);
        assert!(slots[3..].iter().all(|value| *value == 0));
        assert_eq!(pack_syscall_args(&[]), [0; SYSCALL_ARG_SLOTS]);
    }

    #[test]
    fn full_syscalls_pass_through() {
        let args: Vec<isize> = (1..=SYSCALL_ARG_SLOTS as isize).collect();
        assert_eq!(pack_syscall_args(&args).to_vec(), args);
    }

    #[test]
    fn oversized_syscalls_drop_the_excess() {
        let args: Vec<isize> = (100..120).collect();
        let slots = pack_syscall_args(&args);
        assert_eq!(slots.to_vec(), args[..SYSCALL_ARG_SLOTS].to_vec());
    }

    #[test]
    fn narrowing_accepts_in_range_values() {
        assert_eq!(narrow_result(0), Some(0));
        assert_eq!(narrow_result(-1), Some(-1));
        assert_eq!(narrow_result(i32::MAX as i64), Some(i32::MAX as isize));
        assert_eq!(narrow_result(i32::MIN as i64), Some(i32::MIN as isize));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn narrowing_is_lossless_on_64_bit() {
        assert_eq!(narrow_result(i64::MAX), Some(isize::MAX));
        assert_eq!(narrow_result(i64::MIN), Some(isize::MIN));
    }

    #[cfg(target_pointer_width = "32")]
    #[test]
    fn narrowing_rejects_values_past_the_native_width() {
        assert_eq!(narrow_result(i64::from(i32::MAX) + 1), None);
        assert_eq!(narrow_result(i64::MIN), None);
    }
}
