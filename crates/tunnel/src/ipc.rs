use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use tokio::net::UnixStream;
use tokio::process::Command;
use tunnel_protocol::{IPC_CHILD_FD, IPC_FD_ENV};

/// Creates the control channel: the parent keeps the async end, the child end is handed to the
/// spawned process with [`attach_child_end`].
pub fn socketpair() -> io::Result<(UnixStream, StdUnixStream)> {
    let (parent, child) = StdUnixStream::pair()?;
    parent.set_nonblocking(true)?;
    Ok((UnixStream::from_std(parent)?, child))
}

/// Arranges for `child_end` to show up as fd 3 in the spawned process.
pub fn attach_child_end(cmd: &mut Command, child_end: &StdUnixStream) {
    let fd = child_end.as_raw_fd();
    cmd.env(IPC_FD_ENV, IPC_CHILD_FD.to_string());
    unsafe {
        cmd.pre_exec(move || {
            if fd == IPC_CHILD_FD {
                set_inheritable(fd)
            } else if libc::dup2(fd, IPC_CHILD_FD) < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        });
    }
}

/// Opens the control channel passed down by the spawner, if any.
///
/// The descriptor is marked close-on-exec so programs the legacy CLI launches do not keep the
/// channel open after this process exits.
pub fn from_env() -> io::Result<Option<UnixStream>> {
    let Some(raw) = std::env::var_os(IPC_FD_ENV) else {
        return Ok(None);
    };
    let fd: RawFd = raw
        .to_str()
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{IPC_FD_ENV} must be a file descriptor number"),
            )
        })?;
    std::env::remove_var(IPC_FD_ENV);

    set_close_on_exec(fd)?;
    // SAFETY: the spawner placed this descriptor for us and nothing else in the process owns it
    let stream = unsafe { StdUnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream).map(Some)
}

fn set_close_on_exec(fd: RawFd) -> io::Result<()> {
    update_fd_flags(fd, |flags| flags | libc::FD_CLOEXEC)
}

fn set_inheritable(fd: RawFd) -> io::Result<()> {
    update_fd_flags(fd, |flags| flags & !libc::FD_CLOEXEC)
}

fn update_fd_flags(fd: RawFd, update: impl Fn(i32) -> i32) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, update(flags)) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
