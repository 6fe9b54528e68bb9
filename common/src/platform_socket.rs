//! Platform-specific secure channels.
//!
//! Unix: a domain socket whose file is restricted to the owner (mode 0600)
//! before the first accept, with peer credentials read from the kernel.
//! Windows: a named pipe whose DACL grants full control to SYSTEM and
//! read/write to exactly the launching user's SID.

use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
#[cfg(all(unix, not(target_os = "macos")))]
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials as SoPeerCred};
#[cfg(windows)]
use windows_sys::Win32::{
    Foundation::*, Security::Authorization::ConvertStringSecurityDescriptorToSecurityDescriptorW,
    Security::SECURITY_ATTRIBUTES, Storage::FileSystem::*, System::Pipes::*,
};

/// Transport-reported identity of the process on the other end of a stream.
#[derive(Debug, Clone, Copy)]
pub struct PeerCredentials {
    /// Process id of the peer
    pub pid: u32,
    /// User id of the peer; `None` on Windows, where the pipe DACL has
    /// already restricted who can connect
    pub uid: Option<u32>,
}

/// Cross-platform duplex stream.
#[derive(Debug)]
pub enum PlatformStream {
    #[cfg(unix)]
    /// Unix domain socket
    Unix(UnixStream),
    #[cfg(windows)]
    /// Windows named pipe handle
    NamedPipe(PipeHandle),
}

/// Cross-platform listener.
pub enum PlatformListener {
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path:     String,
        timeout:  Duration,
    },
    #[cfg(windows)]
    NamedPipe {
        pipe_name:   String,
        sddl:        Vec<u16>,
        /// Instance created but not yet connected; kept across non-blocking
        /// accept polls so each poll retries the same instance.
        pending:     Option<PipeHandle>,
        nonblocking: bool,
    },
}

/// Owned pipe handle, closed on drop. The handle is only ever used from one
/// thread at a time, but ownership moves across the accept-loop/worker
/// boundary.
#[cfg(windows)]
pub struct PipeHandle(HANDLE);

#[cfg(windows)]
unsafe impl Send for PipeHandle {}

#[cfg(windows)]
impl Drop for PipeHandle {
    fn drop(&mut self) {
        // SAFETY: the handle is valid until this drop and closed exactly once.
        unsafe {
            CloseHandle(self.0);
        }
    }
}

impl PlatformStream {
    /// Bounds every read and write so one stalled peer cannot hold a
    /// handler thread forever.
    pub fn set_timeouts(&self, timeout: Duration) -> Result<()> {
        match self {
            #[cfg(unix)]
            PlatformStream::Unix(stream) => {
                stream
                    .set_read_timeout(Some(timeout))
                    .context("failed to set read timeout")?;
                stream
                    .set_write_timeout(Some(timeout))
                    .context("failed to set write timeout")?;
                Ok(())
            }
            #[cfg(windows)]
            PlatformStream::NamedPipe(_) => {
                // Synchronous named pipes have no per-read deadline; the
                // helper relies on its shutdown flag to bound pipe reads.
                let _ = timeout;
                Ok(())
            }
        }
    }

    /// Extracts the peer's transport-level identity.
    pub fn peer_credentials(&self) -> Result<PeerCredentials> {
        match self {
            #[cfg(unix)]
            PlatformStream::Unix(stream) => unix_peer_credentials(stream),
            #[cfg(windows)]
            PlatformStream::NamedPipe(handle) => {
                let mut client_pid = 0u32;
                // SAFETY: the pipe handle is valid and client_pid is a valid
                // out-pointer for the duration of the call.
                let result = unsafe { GetNamedPipeClientProcessId(handle.0, &mut client_pid) };
                if result == 0 {
                    return Err(anyhow!(
                        "failed to get pipe client process id: {}",
                        std::io::Error::last_os_error()
                    ));
                }
                Ok(PeerCredentials {
                    pid: client_pid,
                    uid: None,
                })
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn unix_peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    let creds = getsockopt(stream, SoPeerCred).context("failed to get peer credentials")?;
    Ok(PeerCredentials {
        pid: creds.pid() as u32,
        uid: Some(creds.uid()),
    })
}

#[cfg(target_os = "macos")]
fn unix_peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    use std::os::unix::io::AsRawFd;

    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;

    // SAFETY: the fd is open and uid/gid are valid out-pointers.
    let result = unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) };
    if result != 0 {
        return Err(anyhow!(
            "failed to get peer uid: {}",
            std::io::Error::last_os_error()
        ));
    }

    let mut pid: libc::pid_t = 0;
    let mut pid_len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;

    // SAFETY: LOCAL_PEERPID writes a pid_t into the provided buffer whose
    // size matches pid_len.
    let result = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_LOCAL,
            libc::LOCAL_PEERPID,
            &mut pid as *mut _ as *mut libc::c_void,
            &mut pid_len,
        )
    };
    if result != 0 {
        return Err(anyhow!(
            "failed to get peer pid: {}",
            std::io::Error::last_os_error()
        ));
    }

    Ok(PeerCredentials {
        pid: pid as u32,
        uid: Some(uid),
    })
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
fn unix_peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    let creds = getsockopt(stream, SoPeerCred)
        .context("peer credential extraction is only supported via SO_PEERCRED on this platform")?;
    Ok(PeerCredentials {
        pid: creds.pid() as u32,
        uid: Some(creds.uid()),
    })
}

impl Read for PlatformStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            PlatformStream::Unix(stream) => stream.read(buf),
            #[cfg(windows)]
            PlatformStream::NamedPipe(handle) => {
                let mut bytes_read = 0u32;
                // SAFETY: valid handle, valid buffer and out-pointer, null
                // overlapped pointer for synchronous I/O.
                let result = unsafe {
                    ReadFile(
                        handle.0,
                        buf.as_mut_ptr(),
                        buf.len() as u32,
                        &mut bytes_read,
                        std::ptr::null_mut(),
                    )
                };
                if result == 0 {
                    let err = std::io::Error::last_os_error();
                    // A client hanging up surfaces as ERROR_BROKEN_PIPE.
                    if err.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32) {
                        return Ok(0);
                    }
                    Err(err)
                } else {
                    Ok(bytes_read as usize)
                }
            }
        }
    }
}

impl Write for PlatformStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            PlatformStream::Unix(stream) => stream.write(buf),
            #[cfg(windows)]
            PlatformStream::NamedPipe(handle) => {
                let mut bytes_written = 0u32;
                // SAFETY: valid handle, valid buffer and out-pointer, null
                // overlapped pointer for synchronous I/O.
                let result = unsafe {
                    WriteFile(
                        handle.0,
                        buf.as_ptr(),
                        buf.len() as u32,
                        &mut bytes_written,
                        std::ptr::null_mut(),
                    )
                };
                if result == 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(bytes_written as usize)
                }
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformStream::Unix(stream) => stream.flush(),
            #[cfg(windows)]
            PlatformStream::NamedPipe(handle) => {
                // SAFETY: FlushFileBuffers only requires a valid handle.
                let result = unsafe { FlushFileBuffers(handle.0) };
                if result == 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl PlatformListener {
    /// Binds the secure channel. `authorized_sid` is the launching user's
    /// identity; it is required on Windows (the pipe DACL is built from it)
    /// and ignored on Unix, where the socket file mode plus the peer
    /// credential check carry the same guarantee.
    pub fn bind(socket_name: &str, authorized_sid: Option<&str>, timeout: Duration) -> Result<Self> {
        #[cfg(unix)]
        {
            let _ = authorized_sid;
            let socket_path = format!("/tmp/{socket_name}");

            if std::path::Path::new(&socket_path).exists() {
                tracing::warn!(path = %socket_path, "removing stale socket file");
                std::fs::remove_file(&socket_path).with_context(|| {
                    format!(
                        "could not remove existing socket file '{socket_path}'; another helper \
                         instance may be running"
                    )
                })?;
            }

            let listener = UnixListener::bind(&socket_path)
                .with_context(|| format!("failed to bind to socket '{socket_path}'"))?;

            // Owner-only, applied before the first accept so no connection is
            // ever admitted under wider permissions.
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to restrict socket '{socket_path}'"))?;

            tracing::info!(path = %socket_path, "secure channel listening");
            Ok(PlatformListener::Unix {
                listener,
                path: socket_path,
                timeout,
            })
        }

        #[cfg(windows)]
        {
            let _ = timeout;
            let sid = authorized_sid
                .ok_or_else(|| anyhow!("an authorized user SID is required on Windows"))?;
            crate::identity::validate_user_sid(sid)?;

            // Full control for SYSTEM, read/write for the launching user,
            // nothing for anyone else (protected DACL, no inheritance).
            let sddl = format!("D:P(A;;GA;;;SY)(A;;GRGW;;;{sid})");
            let sddl: Vec<u16> = sddl.encode_utf16().chain(std::iter::once(0)).collect();

            let pipe_name = format!(r"\\.\pipe\{socket_name}");
            tracing::info!(pipe = %pipe_name, "secure channel configured");
            Ok(PlatformListener::NamedPipe {
                pipe_name,
                sddl,
                pending: None,
                nonblocking: false,
            })
        }
    }

    /// Switches the accept path between blocking and polled operation. The
    /// helper's accept loop polls so its shutdown flag stays observable.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        match self {
            #[cfg(unix)]
            PlatformListener::Unix { listener, .. } => {
                listener
                    .set_nonblocking(nonblocking)
                    .context("failed to change listener blocking mode")?;
                Ok(())
            }
            #[cfg(windows)]
            PlatformListener::NamedPipe {
                nonblocking: flag, ..
            } => {
                *flag = nonblocking;
                Ok(())
            }
        }
    }

    /// Accepts one connection. In non-blocking mode an `io::Error` of kind
    /// `WouldBlock` (wrapped in the returned `anyhow::Error`) means no peer
    /// is waiting yet.
    pub fn accept(&mut self) -> Result<PlatformStream> {
        match self {
            #[cfg(unix)]
            PlatformListener::Unix {
                listener, timeout, ..
            } => {
                let (stream, _) = listener.accept().map_err(anyhow::Error::from)?;

                // Accepted streams are blocking with bounded reads even when
                // the listener itself polls.
                stream
                    .set_nonblocking(false)
                    .context("failed to set accepted socket to blocking mode")?;
                let stream = PlatformStream::Unix(stream);
                stream.set_timeouts(*timeout)?;
                Ok(stream)
            }
            #[cfg(windows)]
            PlatformListener::NamedPipe {
                pipe_name,
                sddl,
                pending,
                nonblocking,
            } => {
                let handle = match pending.take() {
                    Some(handle) => handle,
                    None => create_pipe_instance(pipe_name, sddl, *nonblocking)?,
                };

                // SAFETY: ConnectNamedPipe only requires a valid handle and a
                // null overlapped pointer for synchronous operation.
                let connected = unsafe { ConnectNamedPipe(handle.0, std::ptr::null_mut()) };
                if connected == 0 {
                    // SAFETY: GetLastError is always safe to call.
                    let error = unsafe { GetLastError() };
                    match error {
                        ERROR_PIPE_CONNECTED => {}
                        ERROR_PIPE_LISTENING if *nonblocking => {
                            // No client yet; keep the instance for the next poll.
                            *pending = Some(handle);
                            return Err(anyhow::Error::from(std::io::Error::from(
                                std::io::ErrorKind::WouldBlock,
                            )));
                        }
                        _ => {
                            return Err(anyhow!("failed to connect named pipe: {error}"));
                        }
                    }
                }

                // Back to blocking mode for the connection's own I/O.
                set_pipe_wait(&handle, true)?;
                Ok(PlatformStream::NamedPipe(handle))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for PlatformListener {
    fn drop(&mut self) {
        let PlatformListener::Unix { path, .. } = self;
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(windows)]
fn create_pipe_instance(pipe_name: &str, sddl: &[u16], nonblocking: bool) -> Result<PipeHandle> {
    let pipe_name_wide: Vec<u16> = pipe_name.encode_utf16().chain(std::iter::once(0)).collect();

    // SAFETY: the SDDL string is NUL-terminated UTF-16 and the descriptor
    // out-pointer is valid; the returned descriptor is released with
    // LocalFree after the pipe is created.
    unsafe {
        let mut descriptor: *mut std::ffi::c_void = std::ptr::null_mut();
        let converted = ConvertStringSecurityDescriptorToSecurityDescriptorW(
            sddl.as_ptr(),
            1, // SDDL_REVISION_1
            &mut descriptor,
            std::ptr::null_mut(),
        );
        if converted == 0 {
            return Err(anyhow!(
                "failed to build pipe security descriptor: {}",
                std::io::Error::last_os_error()
            ));
        }

        let security_attrs = SECURITY_ATTRIBUTES {
            nLength:              std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: descriptor,
            bInheritHandle:       0,
        };

        let mode = if nonblocking { PIPE_NOWAIT } else { PIPE_WAIT };
        let handle = CreateNamedPipeW(
            pipe_name_wide.as_ptr(),
            PIPE_ACCESS_DUPLEX,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | mode,
            PIPE_UNLIMITED_INSTANCES,
            64 * 1024, // out buffer size
            64 * 1024, // in buffer size
            0,         // default client wait timeout
            &security_attrs,
        );

        LocalFree(descriptor);

        if handle == INVALID_HANDLE_VALUE {
            return Err(anyhow!(
                "failed to create named pipe '{pipe_name}': {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(PipeHandle(handle))
    }
}

#[cfg(windows)]
fn set_pipe_wait(handle: &PipeHandle, blocking: bool) -> Result<()> {
    let mode = if blocking { PIPE_WAIT } else { PIPE_NOWAIT };
    // SAFETY: valid handle, valid mode pointer, null for unchanged fields.
    let result = unsafe {
        SetNamedPipeHandleState(handle.0, &mode, std::ptr::null_mut(), std::ptr::null_mut())
    };
    if result == 0 {
        return Err(anyhow!(
            "failed to change pipe blocking mode: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// Connects to the helper's secure channel and applies the read/write
/// timeout to the resulting stream.
pub fn connect_socket(socket_name: &str, timeout: Duration) -> Result<PlatformStream> {
    #[cfg(unix)]
    {
        let socket_path = format!("/tmp/{socket_name}");

        let stream = UnixStream::connect(&socket_path).map_err(|e| {
            let hint = match e.kind() {
                std::io::ErrorKind::NotFound => "the helper does not appear to be running",
                std::io::ErrorKind::PermissionDenied => "the socket belongs to a different user",
                std::io::ErrorKind::ConnectionRefused => {
                    "the helper may be starting up or shutting down"
                }
                _ => "unexpected connection failure",
            };
            anyhow!("failed to connect to '{socket_path}': {e} ({hint})")
        })?;

        let stream = PlatformStream::Unix(stream);
        stream.set_timeouts(timeout)?;
        Ok(stream)
    }

    #[cfg(windows)]
    {
        let pipe_name = format!(r"\\.\pipe\{socket_name}");
        let pipe_name_wide: Vec<u16> = pipe_name.encode_utf16().chain(std::iter::once(0)).collect();

        // SAFETY: the pipe name is NUL-terminated UTF-16; the wait bounds how
        // long we block when all instances are busy.
        let wait_result =
            unsafe { WaitNamedPipeW(pipe_name_wide.as_ptr(), timeout.as_millis() as u32) };
        if wait_result == 0 {
            return Err(anyhow!(
                "helper pipe '{pipe_name}' is not available: {}",
                std::io::Error::last_os_error()
            ));
        }

        // SAFETY: valid NUL-terminated name, null security attributes and
        // template are permitted for pipe clients.
        let handle = unsafe {
            CreateFileW(
                pipe_name_wide.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                std::ptr::null_mut(),
                OPEN_EXISTING,
                0,
                std::ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(anyhow!(
                "failed to open helper pipe '{pipe_name}': {}",
                std::io::Error::last_os_error()
            ));
        }

        let stream = PlatformStream::NamedPipe(PipeHandle(handle));
        stream.set_timeouts(timeout)?;
        Ok(stream)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    fn unique_name(tag: &str) -> String {
        format!("netsight-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn socket_file_is_owner_only_before_accept() {
        let name = unique_name("perm");
        let listener = PlatformListener::bind(&name, None, Duration::from_secs(1)).unwrap();
        let mode = std::fs::metadata(format!("/tmp/{name}"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        drop(listener);
        assert!(!std::path::Path::new(&format!("/tmp/{name}")).exists());
    }

    #[test]
    fn peer_credentials_match_this_process() {
        let name = unique_name("creds");
        let mut listener = PlatformListener::bind(&name, None, Duration::from_secs(1)).unwrap();

        let client = std::thread::spawn({
            let name = name.clone();
            move || connect_socket(&name, Duration::from_secs(1)).unwrap()
        });
        let accepted = listener.accept().unwrap();
        let _client = client.join().unwrap();

        let creds = accepted.peer_credentials().unwrap();
        assert_eq!(creds.pid, std::process::id());
        // SAFETY: getuid has no preconditions.
        assert_eq!(creds.uid, Some(unsafe { libc::getuid() }));
    }

    #[test]
    fn nonblocking_accept_reports_would_block() {
        let name = unique_name("nb");
        let mut listener = PlatformListener::bind(&name, None, Duration::from_secs(1)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let err = listener.accept().unwrap_err();
        let io_err = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io_err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn stale_socket_file_is_replaced() {
        let name = unique_name("stale");
        let path = format!("/tmp/{name}");
        std::fs::write(&path, b"stale").unwrap();
        let listener = PlatformListener::bind(&name, None, Duration::from_secs(1)).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_socket());
        drop(listener);
    }
}
