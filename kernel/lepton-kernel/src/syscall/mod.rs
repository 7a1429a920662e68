//! Syscall surface.
//!
//! Handlers operate on the calling process (via the scheduler's current
//! thread) and return `Result`; the architecture entry stub converts
//! errors to the negative-errno convention with
//! [`lepton_core::errno::syscall_ret`].

pub mod process;
pub mod time;
pub mod vfs;

use alloc::sync::Arc;

use lepton_core::{Errno, KResult};

use crate::proc::{self, Process};

/// Returns the calling process, or `ESRCH`-like failure (`EBADF` is
/// never right here; the closest recoverable kind is `EINVAL`).
pub(crate) fn current_process() -> KResult<Arc<Process>> {
    proc::curproc().ok_or(Errno::Inval)
}
