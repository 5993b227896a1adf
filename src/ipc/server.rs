//! IPC accept loop and per-connection dispatch.
//!
//! Each accepted stream gets its own task running [`handle_connection`]. The
//! loop reads one request, handles it, writes at most one reply, and repeats.
//! Protocol errors end the connection; sessions the connection created are
//! released when it ends, whatever the reason.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::HelperError;
use crate::ipc::handlers::{error_envelope, handle_envelope, ConnectionContext, Outcome};
use crate::ipc::state::HelperState;
use crate::ipc::transport::{read_envelope, write_envelope};

/// Serve one client until it disconnects, misbehaves, or shuts down.
pub async fn handle_connection<S>(mut stream: S, state: Arc<HelperState>, peer_pid: Option<u32>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ctx = ConnectionContext::new(state.next_connection_id(), peer_pid);
    tracing::info!(connection = ctx.connection_id, peer_pid = ?peer_pid, "Client connected");

    loop {
        let request = match read_envelope(&mut stream).await {
            Ok(envelope) => envelope,
            Err(e) if e.is_disconnect() => break,
            Err(e) => {
                tracing::warn!(connection = ctx.connection_id, "Closing connection: {e}");
                if let Ok(reply) = error_envelope("", &HelperError::from(e)) {
                    let _ = write_envelope(&mut stream, &reply).await;
                }
                break;
            }
        };

        match handle_envelope(&state, &mut ctx, request) {
            Outcome::Reply(reply) => {
                if let Err(e) = write_envelope(&mut stream, &reply).await {
                    tracing::debug!(connection = ctx.connection_id, "Write failed: {e}");
                    break;
                }
            }
            Outcome::ReplyAndClose(reply) => {
                let _ = write_envelope(&mut stream, &reply).await;
                break;
            }
            Outcome::Close => break,
        }
    }

    ctx.release(&state);
    tracing::info!(connection = ctx.connection_id, "Client disconnected");
}

/// Listen on the configured endpoint and serve clients until the future is dropped.
pub async fn serve(state: Arc<HelperState>) -> anyhow::Result<()> {
    let endpoint = state.config.endpoint.clone();
    #[cfg(unix)]
    {
        unix_impl::serve_unix(state, std::path::Path::new(&endpoint)).await
    }
    #[cfg(windows)]
    {
        windows_impl::serve_named_pipe(state, &endpoint).await
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = state;
        anyhow::bail!("no IPC transport for endpoint {endpoint} on this platform")
    }
}

#[cfg(unix)]
pub use unix_impl::serve_unix;

#[cfg(unix)]
mod unix_impl {
    use std::io;
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Context;
    use tokio::net::UnixListener;

    use super::handle_connection;
    use crate::ipc::state::HelperState;

    /// Socket mode: any local user may connect; authentication gates access.
    const SOCKET_MODE: u32 = 0o666;
    const DIRECTORY_MODE: u32 = 0o755;

    /// Removes the socket file when the server future is dropped.
    struct SocketFileGuard(PathBuf);

    impl Drop for SocketFileGuard {
        fn drop(&mut self) {
            if let Err(e) = std::fs::remove_file(&self.0) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove socket {}: {e}", self.0.display());
                }
            } else {
                tracing::info!(socket_path = %self.0.display(), "Removed socket file");
            }
        }
    }

    pub async fn serve_unix(state: Arc<HelperState>, path: &Path) -> anyhow::Result<()> {
        prepare_socket_path(path)?;
        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        let _guard = SocketFileGuard(path.to_path_buf());
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        tracing::info!(socket_path = %path.display(), "IPC server listening");

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let peer_pid = stream
                        .peer_cred()
                        .ok()
                        .and_then(|cred| cred.pid())
                        .and_then(|pid| u32::try_from(pid).ok());
                    tokio::spawn(handle_connection(stream, Arc::clone(&state), peer_pid));
                }
                Err(e) => {
                    tracing::error!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Create the parent directory and remove a stale socket left by a previous run.
    fn prepare_socket_path(path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(DIRECTORY_MODE))?;
            }
        }
        match std::fs::symlink_metadata(path) {
            Ok(metadata) => {
                if !metadata.file_type().is_socket() {
                    anyhow::bail!("path {} exists but is not a socket", path.display());
                }
                std::fs::remove_file(path)
                    .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
                tracing::debug!(path = %path.display(), "Removed stale socket file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to stat {}", path.display())),
        }
    }
}

#[cfg(windows)]
mod windows_impl {
    use std::ffi::c_void;
    use std::io;
    use std::os::windows::io::AsRawHandle;
    use std::sync::Arc;

    use anyhow::Context;
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    use super::handle_connection;
    use crate::ipc::state::HelperState;

    /// SYSTEM and Administrators: full control. Authenticated users: read/write.
    const PIPE_SDDL: &str = "D:(A;;GA;;;SY)(A;;GA;;;BA)(A;;GRGW;;;AU)";
    const SDDL_REVISION_1: u32 = 1;

    #[repr(C)]
    struct SecurityAttributes {
        n_length: u32,
        lp_security_descriptor: *mut c_void,
        b_inherit_handle: i32,
    }

    #[link(name = "advapi32")]
    extern "system" {
        fn ConvertStringSecurityDescriptorToSecurityDescriptorW(
            string_security_descriptor: *const u16,
            string_sd_revision: u32,
            security_descriptor: *mut *mut c_void,
            security_descriptor_size: *mut u32,
        ) -> i32;
    }

    #[link(name = "kernel32")]
    extern "system" {
        fn LocalFree(mem: *mut c_void) -> *mut c_void;
        fn GetNamedPipeClientProcessId(pipe: *mut c_void, client_process_id: *mut u32) -> i32;
    }

    /// Owned security descriptor built from [`PIPE_SDDL`].
    struct PipeSecurity {
        descriptor: *mut c_void,
    }

    // SAFETY: the descriptor is an immutable LocalAlloc block owned by this
    // value; Windows only reads it during pipe creation.
    unsafe impl Send for PipeSecurity {}

    impl PipeSecurity {
        fn new() -> io::Result<Self> {
            let sddl: Vec<u16> = PIPE_SDDL.encode_utf16().chain(std::iter::once(0)).collect();
            let mut descriptor = std::ptr::null_mut();
            let ok = unsafe {
                ConvertStringSecurityDescriptorToSecurityDescriptorW(
                    sddl.as_ptr(),
                    SDDL_REVISION_1,
                    &mut descriptor,
                    std::ptr::null_mut(),
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { descriptor })
        }

        fn create(&self, pipe_name: &str, first_instance: bool) -> io::Result<NamedPipeServer> {
            let mut attributes = SecurityAttributes {
                n_length: std::mem::size_of::<SecurityAttributes>() as u32,
                lp_security_descriptor: self.descriptor,
                b_inherit_handle: 0,
            };
            let mut options = ServerOptions::new();
            options
                .first_pipe_instance(first_instance)
                .reject_remote_clients(true);
            unsafe {
                options.create_with_security_attributes_raw(
                    pipe_name,
                    &mut attributes as *mut SecurityAttributes as *mut c_void,
                )
            }
        }
    }

    impl Drop for PipeSecurity {
        fn drop(&mut self) {
            unsafe {
                LocalFree(self.descriptor);
            }
        }
    }

    fn client_process_id(pipe: &NamedPipeServer) -> Option<u32> {
        let mut pid = 0u32;
        let ok = unsafe { GetNamedPipeClientProcessId(pipe.as_raw_handle() as *mut c_void, &mut pid) };
        (ok != 0 && pid != 0).then_some(pid)
    }

    pub async fn serve_named_pipe(state: Arc<HelperState>, pipe_name: &str) -> anyhow::Result<()> {
        let security = PipeSecurity::new().context("failed to build pipe security descriptor")?;
        // first_pipe_instance fails if another process already owns the name.
        let mut server = security
            .create(pipe_name, true)
            .with_context(|| format!("failed to create named pipe {pipe_name}"))?;
        tracing::info!(pipe = pipe_name, "IPC server listening");

        loop {
            server.connect().await?;
            let connected = server;
            server = security.create(pipe_name, false)?;

            let peer_pid = client_process_id(&connected);
            tokio::spawn(handle_connection(connected, Arc::clone(&state), peer_pid));
        }
    }
}
