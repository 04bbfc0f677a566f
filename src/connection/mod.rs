//! The raw stream transport and the SASL client which runs on top of it
//! before the binary protocol takes over.

pub(crate) use self::transport::Transport;
mod transport;

use tokio::io::unix::AsyncFd;

use crate::auth::{AuthRequest, AuthResponse};
use crate::error::{Error, ErrorKind, Result};

/// A line-oriented SASL client over a non-blocking transport.
///
/// Bytes read past the final response line are handed back from
/// [`AuthClient::into_parts`] so the binary protocol can resume without
/// losing them.
pub(crate) struct AuthClient {
    fd: AsyncFd<Transport>,
    buf: Vec<u8>,
}

impl AuthClient {
    pub(crate) fn new(transport: Transport) -> Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(transport)?,
            buf: Vec::new(),
        })
    }

    pub(crate) fn transport(&self) -> &Transport {
        self.fd.get_ref()
    }

    pub(crate) fn into_parts(self) -> (AsyncFd<Transport>, Vec<u8>) {
        (self.fd, self.buf)
    }

    /// Send the initial NUL byte which precedes authentication.
    pub(crate) async fn send_nul(&mut self) -> Result<()> {
        self.write_all(b"\0").await
    }

    /// Send a single request line.
    pub(crate) async fn send(&mut self, request: &AuthRequest<'_>) -> Result<()> {
        self.write_all(request.to_string().as_bytes()).await
    }

    /// Read and parse a single `\r\n` terminated response line.
    pub(crate) async fn recv(&mut self) -> Result<AuthResponse> {
        loop {
            if let Some(n) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.drain(..n + 1).collect::<Vec<u8>>();
                let line = std::str::from_utf8(&line)?;
                return AuthResponse::parse_line(line);
            }

            let mut chunk = [0u8; 256];

            let n = loop {
                let mut guard = self.fd.readable().await?;

                match guard.try_io(|fd| {
                    let mut fds = Vec::new();
                    fd.get_ref().recv_with_fds(&mut chunk, &mut fds)
                }) {
                    Ok(result) => break result?,
                    Err(..) => continue,
                }
            };

            if n == 0 {
                return Err(Error::new(ErrorKind::Auth(
                    "unexpected end of stream during authentication".into(),
                )));
            }

            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut at = 0;

        while at < bytes.len() {
            let mut guard = self.fd.writable().await?;

            match guard.try_io(|fd| fd.get_ref().send_with_fds(&bytes[at..], &[])) {
                Ok(result) => at += result?,
                Err(..) => continue,
            }
        }

        Ok(())
    }
}
