//! Single-threaded datagram server loop.
//!
//! One request is processed to completion, flush included, before the
//! next datagram is accepted; the loop itself is the serialization
//! point. Each datagram is a complete request and the reply goes back
//! to whatever address it came from.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    path::Path,
};

use mfs_fs_types::FS_BLOCK_SIZE;
use mfs_protocol::MAX_HEADER_LEN;

use crate::{
    dispatch::{Action, dispatch},
    error::ServerError,
    fs::FileSystem,
};

pub struct Server {
    sock: UdpSocket,
    fs: FileSystem,
}

impl Server {
    /// Opens (or creates) the image and binds the UDP socket on all
    /// interfaces. Port 0 asks the host for an ephemeral port.
    pub fn bind(port: u16, image: &Path) -> Result<Self, ServerError> {
        let fs = FileSystem::open(image)?;
        let sock = UdpSocket::bind(("0.0.0.0", port))?;
        Ok(Self { sock, fs })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// Serves requests until a SHUTDOWN arrives. Returns `Ok(())` on a
    /// clean shutdown; an image I/O failure aborts with the error.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut buf = [0_u8; FS_BLOCK_SIZE + MAX_HEADER_LEN];
        loop {
            let (len, from) = match self.sock.recv_from(&mut buf) {
                Ok(received) => received,
                // spurious on UDP (e.g. an ICMP error from an earlier
                // send); the socket is still usable
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let (reply, action) = dispatch(&mut self.fs, &buf[..len])?;

            // a lost reply is the same as a lost packet; the client
            // retries
            if let Err(err) = self.sock.send_to(&reply, from) {
                eprintln!("mfs-server: failed to send reply to {from}: {err}");
            }

            if action == Action::Shutdown {
                return Ok(());
            }
        }
    }
}
