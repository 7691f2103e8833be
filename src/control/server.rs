use super::{
    CommandHandlers, Reply, Response, decode_request, encode_frame, read_frame,
    write_frame,
};
use crate::types::PeerCredentials;
use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::socket::{
        ControlMessage, MsgFlags, UnixAddr, getsockopt, sendmsg, sockopt,
    },
    unistd::{Gid, Uid, UnlinkatFlags, pipe2, unlinkat},
};
use std::{
    ffi::OsString,
    fs::File,
    io::{ErrorKind, IoSlice, Write},
    os::{
        fd::{AsFd, AsRawFd, OwnedFd},
        unix::net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

/// The Unix socket the supervisor outside the sandbox talks to. `serve`
/// blocks until `close` is called from another thread.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    /// Directory holding the socket, opened before the chroot so the
    /// socket can still be unlinked once `path` no longer resolves.
    dir: OwnedFd,
    name: OsString,
    closed: AtomicBool,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
}

impl ControlServer {
    pub fn bind(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .context(format!("invalid socket path {}", path.display()))?
            .to_os_string();
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let dir = File::open(parent)
            .context(format!("failed to open {}", parent.display()))?;
        if path.symlink_metadata().is_ok() {
            std::fs::remove_file(path).context(format!(
                "failed to remove stale socket {}",
                path.display()
            ))?;
        }
        let listener = UnixListener::bind(path).context(format!(
            "failed to bind control socket {}",
            path.display()
        ))?;
        listener.set_nonblocking(true)?;
        let (wake_read, wake_write) =
            pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
                .context("failed to create wake pipe")?;

        info!("Control channel listening on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            dir: dir.into(),
            name,
            closed: AtomicBool::new(false),
            wake_read,
            wake_write,
        })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chown(&self, uid: Uid, gid: Gid) -> Result<()> {
        nix::unistd::chown(&self.path, Some(uid), Some(gid))
            .context(format!("failed to chown {}", self.path.display()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops the serve loop. Calling it again does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing control channel");
        if let Err(e) = nix::unistd::write(&self.wake_write, &[1]) {
            warn!("Failed to wake control channel: {}", e);
        }
    }

    pub fn serve(&self, handlers: Arc<CommandHandlers>) -> Result<()> {
        while !self.is_closed() {
            let mut fds = [
                PollFd::new(self.listener.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.wake_read.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(e).context("failed to poll control channel");
                }
            }
            if self.is_closed() {
                break;
            }
            self.accept_pending(&handlers);
        }

        let removed = unlinkat(
            Some(self.dir.as_raw_fd()),
            self.name.as_os_str(),
            UnlinkatFlags::NoRemoveDir,
        );
        if let Err(e) = removed {
            debug!("Unable to remove {}: {}", self.path.display(), e);
        }
        info!("Control channel closed");
        Ok(())
    }

    fn accept_pending(&self, handlers: &Arc<CommandHandlers>) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let handlers = handlers.clone();
                    let spawned = thread::Builder::new()
                        .name("control-conn".to_string())
                        .spawn(move || handle_connection(stream, &handlers));
                    if let Err(e) = spawned {
                        warn!(
                            "Failed to start control connection thread: {}",
                            e
                        );
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Failed to accept control connection: {}", e);
                    return;
                }
            }
        }
    }
}

fn peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    match getsockopt(stream, sockopt::PeerCredentials) {
        Ok(cred) => Some(PeerCredentials {
            pid: cred.pid(),
            uid: Uid::from_raw(cred.uid()),
            gid: Gid::from_raw(cred.gid()),
        }),
        Err(e) => {
            warn!("Unable to read peer credentials: {}", e);
            None
        }
    }
}

/// Serves one connection until the peer hangs up or the stream breaks.
/// Malformed requests are answered, not fatal.
pub fn handle_connection(mut stream: UnixStream, handlers: &CommandHandlers) {
    if let Err(e) = stream.set_nonblocking(false) {
        warn!("Failed to configure control connection: {}", e);
        return;
    }
    let peer = peer_credentials(&stream);
    if let Some(peer) = &peer {
        trace!("Control connection from pid {} uid {}", peer.pid, peer.uid);
    }

    loop {
        let payload = match read_frame(&mut stream) {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                debug!("Dropping control connection: {:#}", e);
                break;
            }
        };

        let reply = match decode_request(&payload) {
            Ok(request) => handlers.dispatch(request, peer.as_ref()),
            Err(e) => Response::error(format!("{:#}", e)).into(),
        };

        if let Err(e) = send_reply(&mut stream, reply) {
            warn!("Failed to send control response: {:#}", e);
            break;
        }
    }
}

/// Writes the response frame. A descriptor rides along as SCM_RIGHTS on
/// the same sendmsg, then our copy is closed.
pub fn send_reply(stream: &mut UnixStream, reply: Reply) -> Result<()> {
    let payload = serde_json::to_vec(&reply.response)
        .context("failed to encode response")?;
    let Some(fd) = reply.fd else {
        return write_frame(stream, &payload);
    };

    let frame = encode_frame(&payload)?;

    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&frame)];
    let sent = loop {
        match sendmsg(
            stream.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None::<&UnixAddr>,
        ) {
            Ok(sent) => break sent,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("failed to send descriptor"),
        }
    };
    if sent < frame.len() {
        stream
            .write_all(&frame[sent..])
            .context("failed to write control response")?;
    }
    drop(fd);
    Ok(())
}
