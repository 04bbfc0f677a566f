use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{
    connect, recvmsg, sendmsg, socket, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixAddr,
};

use crate::address::BusAddress;
use crate::error::{Error, ErrorKind, Result};

/// The maximum number of file descriptors accepted in a single control
/// message.
const MAX_UNIX_FDS: usize = 16;

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

/// A stream transport to a message bus.
///
/// File descriptor passing is only available on unix domain sockets.
pub(crate) struct Transport {
    stream: Stream,
}

impl Transport {
    /// Connect to the first address in the list which accepts a connection.
    pub(crate) fn connect(addresses: &[BusAddress]) -> Result<Self> {
        let mut last = None;

        for address in addresses {
            match Self::connect_one(address) {
                Ok(transport) => return Ok(transport),
                Err(error) => last = Some(error),
            }
        }

        match last {
            Some(error) => Err(error),
            None => Err(Error::new(ErrorKind::InvalidAddress(
                "address contains no entries".into(),
            ))),
        }
    }

    fn connect_one(address: &BusAddress) -> Result<Self> {
        match address.transport() {
            "unix" => {
                if let Some(path) = address.option("path") {
                    let stream = UnixStream::connect(path)?;

                    return Ok(Self {
                        stream: Stream::Unix(stream),
                    });
                }

                if let Some(name) = address.option("abstract") {
                    let fd = socket(
                        AddressFamily::Unix,
                        SockType::Stream,
                        SockFlag::empty(),
                        None,
                    )
                    .map_err(io::Error::from)?;

                    let addr = UnixAddr::new_abstract(name.as_bytes()).map_err(io::Error::from)?;
                    connect(fd.as_raw_fd(), &addr).map_err(io::Error::from)?;

                    return Ok(Self {
                        stream: Stream::Unix(UnixStream::from(fd)),
                    });
                }

                Err(Error::new(ErrorKind::InvalidAddress(
                    "got unix transport with unknown path specifier".into(),
                )))
            }
            "tcp" => {
                let Some(host) = address.option("host") else {
                    return Err(Error::new(ErrorKind::InvalidAddress(
                        "tcp transport requires a `host` option".into(),
                    )));
                };

                let Some(port) = address.option("port") else {
                    return Err(Error::new(ErrorKind::InvalidAddress(
                        "tcp transport requires a `port` option".into(),
                    )));
                };

                let Ok(port) = port.parse::<u16>() else {
                    return Err(Error::new(ErrorKind::InvalidAddress(
                        format!("invalid tcp port `{port}`").into(),
                    )));
                };

                let stream = TcpStream::connect((host, port))?;

                Ok(Self {
                    stream: Stream::Tcp(stream),
                })
            }
            transport => Err(Error::new(ErrorKind::InvalidAddress(
                format!("got unknown address transport `{transport}`").into(),
            ))),
        }
    }

    /// Set the transport as non-blocking.
    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match &self.stream {
            Stream::Unix(stream) => stream.set_nonblocking(nonblocking),
            Stream::Tcp(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    /// Test if the transport supports file descriptor passing.
    pub(crate) fn supports_unix_fd(&self) -> bool {
        matches!(self.stream, Stream::Unix(..))
    }

    /// Duplicate the transport, so reads and writes can be driven by
    /// separate tasks.
    pub(crate) fn try_clone(&self) -> io::Result<Self> {
        let stream = match &self.stream {
            Stream::Unix(stream) => Stream::Unix(stream.try_clone()?),
            Stream::Tcp(stream) => Stream::Tcp(stream.try_clone()?),
        };

        Ok(Self { stream })
    }

    /// Shut down both halves of the transport.
    pub(crate) fn shutdown(&self) -> io::Result<()> {
        match &self.stream {
            Stream::Unix(stream) => stream.shutdown(Shutdown::Both),
            Stream::Tcp(stream) => stream.shutdown(Shutdown::Both),
        }
    }

    /// Write bytes, passing the given file descriptors along with the first
    /// byte as `SCM_RIGHTS` cargo.
    pub(crate) fn send_with_fds(&self, bytes: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        match &self.stream {
            Stream::Unix(stream) => {
                let iov = [io::IoSlice::new(bytes)];
                let raw = fds.iter().map(|fd| fd.as_raw_fd()).collect::<Vec<RawFd>>();

                let control = [ControlMessage::ScmRights(&raw)];

                let control = if raw.is_empty() { &control[..0] } else { &control[..] };

                let n = sendmsg::<()>(
                    stream.as_raw_fd(),
                    &iov,
                    control,
                    MsgFlags::empty(),
                    None,
                )
                .map_err(io::Error::from)?;

                Ok(n)
            }
            Stream::Tcp(stream) => {
                if !fds.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "cannot pass file descriptors over tcp",
                    ));
                }

                io::Write::write(&mut &*stream, bytes)
            }
        }
    }

    /// Read bytes, accumulating any `SCM_RIGHTS` cargo into `fds`.
    pub(crate) fn recv_with_fds(
        &self,
        buf: &mut [u8],
        fds: &mut Vec<OwnedFd>,
    ) -> io::Result<usize> {
        match &self.stream {
            Stream::Unix(stream) => {
                let mut iov = [io::IoSliceMut::new(buf)];
                let mut control = nix::cmsg_space!([RawFd; MAX_UNIX_FDS]);

                let message = recvmsg::<()>(
                    stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut control),
                    MsgFlags::empty(),
                )
                .map_err(io::Error::from)?;

                let bytes = message.bytes;

                for cmsg in message.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        for fd in received {
                            // SAFETY: The kernel transferred ownership of the
                            // descriptor to this process.
                            fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }

                Ok(bytes)
            }
            Stream::Tcp(stream) => io::Read::read(&mut &*stream, buf),
        }
    }
}

impl AsRawFd for Transport {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        match &self.stream {
            Stream::Unix(stream) => stream.as_raw_fd(),
            Stream::Tcp(stream) => stream.as_raw_fd(),
        }
    }
}
