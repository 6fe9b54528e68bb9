//! Executable-path verification for authenticating clients.
//!
//! When a handshake carries an executable path, it must match what the OS
//! reports for the claimed process id. Verification that cannot be performed
//! (the process exited, /proc is gone, access denied) is reported as its own
//! outcome so the caller can deny with a distinguishable error.

use std::path::{Path, PathBuf};

use anyhow::Result;

/// Outcome of checking a claimed path against the OS.
#[derive(Debug)]
pub enum ExeVerification {
    Match,
    Mismatch { observed: PathBuf },
    /// The OS could not tell us; authentication fails closed on this.
    Unavailable { reason: String },
}

/// Compares the claimed path with the OS-observed executable of `pid`.
pub fn verify_claimed_path(pid: u32, claimed: &Path) -> ExeVerification {
    let observed = match process_executable_path(pid) {
        Ok(path) => path,
        Err(e) => {
            return ExeVerification::Unavailable {
                reason: format!("{e:#}"),
            }
        }
    };

    // The observed path comes back resolved; canonicalize the claim so
    // symlinked install locations still compare equal.
    let claimed = std::fs::canonicalize(claimed).unwrap_or_else(|_| claimed.to_path_buf());
    if claimed == observed {
        ExeVerification::Match
    } else {
        ExeVerification::Mismatch { observed }
    }
}

#[cfg(target_os = "linux")]
pub fn process_executable_path(pid: u32) -> Result<PathBuf> {
    use anyhow::Context;

    std::fs::read_link(format!("/proc/{pid}/exe"))
        .with_context(|| format!("failed to read executable path for pid {pid}"))
}

#[cfg(target_os = "macos")]
pub fn process_executable_path(pid: u32) -> Result<PathBuf> {
    use std::ffi::CStr;

    use anyhow::{anyhow, Context};

    let mut path_buf = [0i8; 4096]; // PROC_PIDPATHINFO_MAXSIZE

    // SAFETY: proc_pidpath writes at most `path_buf.len()` bytes into the
    // provided buffer and NUL-terminates on success (ret > 0).
    let ret = unsafe {
        libc::proc_pidpath(
            pid as i32,
            path_buf.as_mut_ptr() as *mut std::ffi::c_void,
            path_buf.len() as u32,
        )
    };
    if ret <= 0 {
        return Err(anyhow!("proc_pidpath failed for pid {pid}"));
    }

    // SAFETY: ret > 0 guarantees a valid NUL-terminated C string.
    let path = unsafe { CStr::from_ptr(path_buf.as_ptr()) }
        .to_str()
        .context("process path contains invalid UTF-8")?;
    Ok(PathBuf::from(path))
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
pub fn process_executable_path(pid: u32) -> Result<PathBuf> {
    use anyhow::Context;

    std::fs::read_link(format!("/proc/{pid}/exe")).with_context(|| {
        format!("executable path lookup is not supported for pid {pid} on this platform")
    })
}

#[cfg(windows)]
pub fn process_executable_path(pid: u32) -> Result<PathBuf> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;

    use anyhow::anyhow;

    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    // SAFETY: handles are checked before use and closed on every path; the
    // buffer pointer and size stay in sync.
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return Err(anyhow!(
                "failed to open process {pid}: {}",
                std::io::Error::last_os_error()
            ));
        }

        let mut buffer = vec![0u16; 1024];
        let mut size = buffer.len() as u32;
        let result = QueryFullProcessImageNameW(handle, PROCESS_NAME_WIN32, buffer.as_mut_ptr(), &mut size);
        CloseHandle(handle);

        if result == 0 {
            return Err(anyhow!(
                "failed to query image name for pid {pid}: {}",
                std::io::Error::last_os_error()
            ));
        }

        buffer.truncate(size as usize);
        Ok(OsString::from_wide(&buffer).into())
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn own_executable_matches() {
        let me = std::env::current_exe().unwrap();
        assert!(matches!(
            verify_claimed_path(std::process::id(), &me),
            ExeVerification::Match
        ));
    }

    #[test]
    fn wrong_path_is_a_mismatch() {
        match verify_claimed_path(std::process::id(), Path::new("/usr/bin/true")) {
            ExeVerification::Mismatch { observed } => {
                assert_eq!(observed, std::env::current_exe().unwrap());
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn dead_pid_is_unavailable() {
        // Pids wrap well below this on Linux.
        match verify_claimed_path(u32::MAX - 1, Path::new("/usr/bin/true")) {
            ExeVerification::Unavailable { .. } => {}
            other => panic!("expected unavailable, got {other:?}"),
        }
    }
}
