use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::PacketStream;

const LISTEN_BACKLOG: libc::c_int = 8;

/// Listening `SOCK_SEQPACKET` Unix domain socket.
///
/// The external device process normally owns this side; the bridge connects
/// with [`SeqPacketListener::connect`]. The filesystem path is removed on drop
/// as long as it still refers to the socket this listener created.
pub struct SeqPacketListener {
    fd: OwnedFd,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl SeqPacketListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    /// Bind and listen on a filesystem path.
    ///
    /// If the path already exists and is a socket, it is removed first (stale
    /// socket cleanup). Any other kind of file is left alone and reported.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (addr, addr_len) = socket_addr(&path)?;

        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| TransportError::Bind {
                    path: path.clone(),
                    source: e,
                })?;
            } else {
                return Err(TransportError::Bind {
                    path,
                    source: io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
        }

        let fd = PacketStream::new_socket()?;

        // SAFETY: `addr` is an initialized sockaddr_un and `addr_len` does not exceed its size.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
                addr_len,
            )
        };
        if rc != 0 {
            return Err(TransportError::Bind {
                path,
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: listen(2) on a bound socket we own.
        if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } != 0 {
            return Err(TransportError::Bind {
                path,
                source: io::Error::last_os_error(),
            });
        }

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            TransportError::Bind {
                path: path.clone(),
                source: e,
            }
        })?;
        let created = std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
            path: path.clone(),
            source: e,
        })?;

        info!(?path, "listening on seqpacket socket");

        Ok(Self {
            fd,
            path,
            created_inode: Some((created.dev(), created.ino())),
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<PacketStream> {
        loop {
            // SAFETY: accept(2) with null address output is permitted.
            let rc = unsafe {
                libc::accept(
                    self.fd.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(TransportError::Accept(err));
            }
            // SAFETY: accept(2) returned a fresh descriptor owned by nobody else.
            let fd = unsafe { OwnedFd::from_raw_fd(rc) };
            // Some platforms copy O_NONBLOCK from the listener.
            set_fd_nonblocking(fd.as_raw_fd(), false).map_err(TransportError::Accept)?;
            debug!(path = ?self.path, "accepted connection");
            return Ok(PacketStream::from_owned_fd(fd));
        }
    }

    /// Connect to a listening seqpacket socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<PacketStream> {
        let path = path.as_ref();
        let (addr, addr_len) = socket_addr(path)?;
        let fd = PacketStream::new_socket()?;

        // SAFETY: `addr` is an initialized sockaddr_un and `addr_len` does not exceed its size.
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
                addr_len,
            )
        };
        if rc != 0 {
            return Err(TransportError::Connect {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }

        debug!(?path, "connected to seqpacket socket");
        Ok(PacketStream::from_owned_fd(fd))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// In non-blocking mode [`accept`](Self::accept) fails with
    /// `WouldBlock` instead of waiting. Accepted streams are always blocking.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        set_fd_nonblocking(self.fd.as_raw_fd(), nonblocking).map_err(TransportError::Io)
    }
}

fn set_fd_nonblocking(fd: std::os::fd::RawFd, nonblocking: bool) -> io::Result<()> {
    // SAFETY: fcntl(2) F_GETFL on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let updated = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if updated != flags {
        // SAFETY: fcntl(2) F_SETFL with flags derived from F_GETFL.
        if unsafe { libc::fcntl(fd, libc::F_SETFL, updated) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn socket_addr(path: &Path) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    let bytes = path.as_os_str().as_bytes();
    // One byte stays reserved for the terminating NUL.
    let max = addr.sun_path.len();
    if bytes.len() >= max {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len: bytes.len(),
            max,
        });
    }

    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

impl Drop for SeqPacketListener {
    fn drop(&mut self) {
        if let Some((expected_dev, expected_ino)) = self.created_inode {
            if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
                if metadata.file_type().is_socket()
                    && metadata.dev() == expected_dev
                    && metadata.ino() == expected_ino
                {
                    debug!(path = ?self.path, "cleaning up socket file");
                    let _ = std::fs::remove_file(&self.path);
                } else {
                    debug!(
                        path = ?self.path,
                        "socket path identity changed; skipping cleanup"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for SeqPacketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeqPacketListener")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "extsock-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_bind_accept_connect() {
        let dir = temp_dir("transport");
        let sock_path = dir.join("test.sock");

        let listener = SeqPacketListener::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let path_clone = sock_path.clone();
        let handle = std::thread::spawn(move || {
            let client = SeqPacketListener::connect(&path_clone).unwrap();
            client.send_packet(&[0x06, 0x03, 0xF8, 0x00, 0x08]).unwrap();
            client.send_packet(&[0x00]).unwrap();
        });

        let server = listener.accept().unwrap();
        let mut buf = [0u8; 32];
        let n = server.recv_packet(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x06, 0x03, 0xF8, 0x00, 0x08]);
        let n = server.recv_packet(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x00]);

        handle.join().unwrap();

        drop(listener);
        assert!(
            !sock_path.exists(),
            "socket file should be cleaned up on drop"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_nonblocking_accept() {
        let dir = temp_dir("nonblocking");
        let sock_path = dir.join("nb.sock");
        let listener = SeqPacketListener::bind(&sock_path).unwrap();
        listener.set_nonblocking(true).unwrap();

        match listener.accept() {
            Err(TransportError::Accept(err)) => assert_eq!(err.kind(), io::ErrorKind::WouldBlock),
            other => panic!("expected WouldBlock, got {other:?}"),
        }

        let client = SeqPacketListener::connect(&sock_path).unwrap();
        let server = listener.accept().unwrap();
        server
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        client.send_packet(&[0x00]).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(server.recv_packet(&mut buf).unwrap(), 1);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = SeqPacketListener::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));

        let result = SeqPacketListener::connect(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn test_connect_missing_path_fails() {
        let dir = temp_dir("missing");
        let result = SeqPacketListener::connect(dir.join("absent.sock"));
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bind_default_permissions_hardened() {
        let dir = temp_dir("perms");
        let sock_path = dir.join("perm.sock");

        let listener = SeqPacketListener::bind(&sock_path).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = temp_dir("stale");
        let sock_path = dir.join("stale.sock");

        let first = SeqPacketListener::bind(&sock_path).unwrap();
        // Leak the first listener's path by forgetting its cleanup.
        std::mem::forget(first);

        let second = SeqPacketListener::bind(&sock_path).unwrap();
        assert!(sock_path.exists());
        drop(second);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bind_rejects_existing_non_socket_file() {
        let dir = temp_dir("bind-file");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = SeqPacketListener::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_drop_does_not_remove_replaced_path() {
        let dir = temp_dir("drop-race");
        let sock_path = dir.join("drop.sock");

        let listener = SeqPacketListener::bind(&sock_path).unwrap();
        std::fs::remove_file(&sock_path).unwrap();
        std::fs::write(&sock_path, b"replacement-file").unwrap();

        drop(listener);
        assert!(
            sock_path.exists(),
            "drop must not remove path if inode identity changed"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }
}
