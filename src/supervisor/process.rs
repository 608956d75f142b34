//! Cross-platform process termination helpers used by the stop escalation
//! path. The waiter task owns the child handle, so escalation signals the
//! process by PID.

use anyhow::Result;

/// Ask a process to terminate cooperatively (SIGTERM / TerminateProcess).
pub fn terminate_pid(pid: u32) -> Result<()> {
    signal_pid(pid, false)
}

/// Unconditionally kill a process (SIGKILL / forced TerminateProcess).
pub fn force_kill_pid(pid: u32) -> Result<()> {
    signal_pid(pid, true)
}

#[cfg(target_os = "windows")]
fn signal_pid(pid: u32, force: bool) -> Result<()> {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            anyhow::bail!("Failed to open process {}", pid);
        }
        let exit_code = if force { 1 } else { 0 };
        let result = TerminateProcess(handle, exit_code);
        CloseHandle(handle);
        if result == 0 {
            anyhow::bail!("TerminateProcess failed for PID {}", pid);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn signal_pid(pid: u32, force: bool) -> Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    signal::kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| anyhow::anyhow!("Failed to send {} to PID {}: {}", signal, pid, e))?;
    Ok(())
}
