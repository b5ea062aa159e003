//! Thin MFS client stub.
//!
//! One call, one datagram: each operation serializes a request frame,
//! sends it to the server, and waits for the reply. The transport is
//! lossy, so every request is retried on a fixed timeout, up to a
//! bounded number of attempts. Retries are safe: CREAT and UNLINK are
//! idempotent on the server and WRITE/READ address absolute blocks.

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use mfs_fs_types::FS_BLOCK_SIZE;
use mfs_protocol::{FileKind, MAX_HEADER_LEN, ProtocolError, Reply, Request, Stat, encode_request};

/// Reply wait per attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts per request before giving up.
pub const DEFAULT_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("no reply after {0} attempts")]
    RetriesExhausted(u32),
    #[error("malformed reply: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("server reported failure")]
    Server,
}

pub struct MfsClient {
    sock: UdpSocket,
    server: SocketAddr,
    attempts: u32,
}

impl MfsClient {
    /// Connects to a server address with the default timeout and retry
    /// policy.
    pub fn connect<A: ToSocketAddrs>(server: A) -> Result<Self, ClientError> {
        Self::with_config(server, DEFAULT_TIMEOUT, DEFAULT_ATTEMPTS)
    }

    pub fn with_config<A: ToSocketAddrs>(
        server: A,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Self, ClientError> {
        let server = server
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no server address"))?;
        let sock = UdpSocket::bind(("0.0.0.0", 0))?;
        sock.set_read_timeout(Some(timeout))?;
        Ok(Self {
            sock,
            server,
            attempts,
        })
    }

    pub fn lookup(&self, pinum: i32, name: &str) -> Result<u32, ClientError> {
        let reply = self.send_receive(&encode_request(&Request::Lookup { pinum, name }))?;
        Reply::parse_inum(&reply)?.ok_or(ClientError::Server)
    }

    pub fn stat(&self, inum: i32) -> Result<Stat, ClientError> {
        let reply = self.send_receive(&encode_request(&Request::Stat { inum }))?;
        Reply::parse_stat(&reply)?.ok_or(ClientError::Server)
    }

    pub fn creat(&self, pinum: i32, kind: FileKind, name: &str) -> Result<(), ClientError> {
        let reply = self.send_receive(&encode_request(&Request::Creat { pinum, kind, name }))?;
        Self::ack(&reply)
    }

    pub fn unlink(&self, pinum: i32, name: &str) -> Result<(), ClientError> {
        let reply = self.send_receive(&encode_request(&Request::Unlink { pinum, name }))?;
        Self::ack(&reply)
    }

    pub fn write(
        &self,
        inum: i32,
        data: &[u8; FS_BLOCK_SIZE],
        block: i32,
    ) -> Result<(), ClientError> {
        let reply = self.send_receive(&encode_request(&Request::Write { inum, block, data }))?;
        Self::ack(&reply)
    }

    pub fn read(&self, inum: i32, block: i32) -> Result<Box<[u8; FS_BLOCK_SIZE]>, ClientError> {
        let reply = self.send_receive(&encode_request(&Request::Read { inum, block }))?;
        Reply::parse_block(&reply)?.ok_or(ClientError::Server)
    }

    /// Asks the server to flush and exit. Exhausted retries count as
    /// success here: the server may have replied and gone away before
    /// the reply reached us.
    pub fn shutdown(&self) -> Result<(), ClientError> {
        match self.send_receive(&encode_request(&Request::Shutdown)) {
            Ok(reply) => Self::ack(&reply),
            Err(ClientError::RetriesExhausted(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn ack(reply: &[u8]) -> Result<(), ClientError> {
        if Reply::parse_ack(reply)? {
            Ok(())
        } else {
            Err(ClientError::Server)
        }
    }

    fn send_receive(&self, frame: &[u8]) -> Result<Vec<u8>, ClientError> {
        let mut buf = [0_u8; FS_BLOCK_SIZE + MAX_HEADER_LEN];
        for _ in 0..self.attempts {
            self.sock.send_to(frame, self.server)?;
            match self.sock.recv_from(&mut buf) {
                Ok((len, _from)) => return Ok(buf[..len].to_vec()),
                Err(err)
                    if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Err(ClientError::RetriesExhausted(self.attempts))
    }
}
