//! Wire protocol shared by the MFS server and client stub.
//!
//! A request is a single datagram: an ASCII header of space-separated
//! tokens, optionally followed (for `WRITE`) by a NUL byte and exactly
//! one block of raw payload.
//!
//! | verb     | header                      | payload |
//! |----------|-----------------------------|---------|
//! | LOOKUP   | `LOOKUP <pinum> <name>`     | —       |
//! | STAT     | `STAT <inum>`               | —       |
//! | CREAT    | `CREAT <pinum> <ty> <name>` | —       |
//! | UNLINK   | `UNLINK <pinum> <name>`     | —       |
//! | WRITE    | `WRITE <inum> <block>` NUL  | 1 block |
//! | READ     | `READ <inum> <block>`       | —       |
//! | SHUTDOWN | `SHUTDOWN`                  | —       |
//!
//! Replies are ASCII decimal, except READ: a successful READ reply is
//! the single status byte `b'0'` followed by one block of raw data, so
//! a block that happens to start with the bytes `"-1"` can never be
//! mistaken for a failure reply.

use std::str::{self, FromStr as _};

use memchr::memchr;
use mfs_fs_types::{FS_BLOCK_SIZE, MAX_NAME_LEN};
use strum::{Display, EnumString, FromRepr};

/// Upper bound on a request header, taken from the reference client's
/// send buffer. A receive buffer of `FS_BLOCK_SIZE + MAX_HEADER_LEN`
/// holds any legal frame.
pub const MAX_HEADER_LEN: usize = 1024;

/// The generic failure reply; every non-fatal server error collapses
/// to this.
pub const FAILURE: &[u8] = b"-1";

/// Status byte prefixing a successful READ reply.
pub const READ_OK: u8 = b'0';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Verb {
    Lookup,
    Stat,
    Creat,
    Unlink,
    Write,
    Read,
    Shutdown,
}

/// File type code as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(i32)]
pub enum FileKind {
    Directory = 0,
    Regular = 1,
}

/// A parsed request frame. Name and payload borrow from the datagram
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Lookup {
        pinum: i32,
        name: &'a str,
    },
    Stat {
        inum: i32,
    },
    Creat {
        pinum: i32,
        kind: FileKind,
        name: &'a str,
    },
    Unlink {
        pinum: i32,
        name: &'a str,
    },
    Write {
        inum: i32,
        block: i32,
        data: &'a [u8; FS_BLOCK_SIZE],
    },
    Read {
        inum: i32,
        block: i32,
    },
    Shutdown,
}

/// STAT reply payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub kind: FileKind,
    pub size: u32,
    /// Raw first direct pointer, `-1` if unallocated.
    pub addr0: i32,
}

/// A reply frame as the server produces it.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// LOOKUP success: the found inode number.
    Inum(u32),
    /// STAT success.
    Stat(Stat),
    /// CREAT / UNLINK / WRITE / SHUTDOWN success.
    Ok,
    /// READ success: one block of data.
    Block(Box<[u8; FS_BLOCK_SIZE]>),
    /// Any non-fatal failure.
    Failure,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty request frame")]
    EmptyFrame,
    #[error("header is not valid UTF-8")]
    NotUtf8,
    #[error("unknown verb")]
    UnknownVerb,
    #[error("missing argument")]
    MissingArgument,
    #[error("invalid integer argument")]
    InvalidInteger,
    #[error("invalid file type code: {0}")]
    InvalidFileKind(i32),
    #[error("name is empty or not ASCII")]
    InvalidName,
    #[error("name longer than {MAX_NAME_LEN} bytes")]
    NameTooLong,
    #[error("trailing input after arguments")]
    TrailingInput,
    #[error("unexpected block payload")]
    UnexpectedPayload,
    #[error("block payload shorter than {FS_BLOCK_SIZE} bytes")]
    BadPayloadLength,
    #[error("malformed reply frame")]
    MalformedReply,
}

fn int_arg<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Result<i32, ProtocolError> {
    let tok = tokens.next().ok_or(ProtocolError::MissingArgument)?;
    i32::from_str(tok).map_err(|_| ProtocolError::InvalidInteger)
}

fn name_arg<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Result<&'a str, ProtocolError> {
    let name = tokens.next().ok_or(ProtocolError::MissingArgument)?;
    if name.is_empty() || !name.is_ascii() {
        return Err(ProtocolError::InvalidName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ProtocolError::NameTooLong);
    }
    Ok(name)
}

fn finish<'a>(mut tokens: impl Iterator<Item = &'a str>) -> Result<(), ProtocolError> {
    if tokens.next().is_some() {
        return Err(ProtocolError::TrailingInput);
    }
    Ok(())
}

/// Parses one request datagram.
pub fn parse_request(frame: &[u8]) -> Result<Request<'_>, ProtocolError> {
    let (header, payload) = match memchr(0, frame) {
        Some(pos) => (&frame[..pos], Some(&frame[pos + 1..])),
        None => (frame, None),
    };
    let header = str::from_utf8(header).map_err(|_| ProtocolError::NotUtf8)?;

    let mut tokens = header.split(' ');
    let verb = tokens
        .next()
        .filter(|tok| !tok.is_empty())
        .ok_or(ProtocolError::EmptyFrame)?;
    let verb = Verb::from_str(verb).map_err(|_| ProtocolError::UnknownVerb)?;

    if verb != Verb::Write && payload.is_some() {
        return Err(ProtocolError::UnexpectedPayload);
    }

    let req = match verb {
        Verb::Lookup => Request::Lookup {
            pinum: int_arg(&mut tokens)?,
            name: name_arg(&mut tokens)?,
        },
        Verb::Stat => Request::Stat {
            inum: int_arg(&mut tokens)?,
        },
        Verb::Creat => {
            let pinum = int_arg(&mut tokens)?;
            let code = int_arg(&mut tokens)?;
            let kind = FileKind::from_repr(code).ok_or(ProtocolError::InvalidFileKind(code))?;
            let name = name_arg(&mut tokens)?;
            Request::Creat { pinum, kind, name }
        }
        Verb::Unlink => Request::Unlink {
            pinum: int_arg(&mut tokens)?,
            name: name_arg(&mut tokens)?,
        },
        Verb::Write => {
            let inum = int_arg(&mut tokens)?;
            let block = int_arg(&mut tokens)?;
            // the reference client pads the datagram to a fixed length,
            // so bytes past the block are ignored rather than rejected
            let payload = payload
                .and_then(|p| p.get(..FS_BLOCK_SIZE))
                .ok_or(ProtocolError::BadPayloadLength)?;
            let data = payload
                .try_into()
                .map_err(|_| ProtocolError::BadPayloadLength)?;
            Request::Write { inum, block, data }
        }
        Verb::Read => Request::Read {
            inum: int_arg(&mut tokens)?,
            block: int_arg(&mut tokens)?,
        },
        Verb::Shutdown => Request::Shutdown,
    };
    finish(tokens)?;
    Ok(req)
}

/// Encodes a request into a datagram (the client side of
/// [`parse_request`]).
#[must_use]
pub fn encode_request(req: &Request<'_>) -> Vec<u8> {
    match req {
        Request::Lookup { pinum, name } => format!("{} {pinum} {name}", Verb::Lookup).into_bytes(),
        Request::Stat { inum } => format!("{} {inum}", Verb::Stat).into_bytes(),
        Request::Creat { pinum, kind, name } => {
            format!("{} {pinum} {} {name}", Verb::Creat, *kind as i32).into_bytes()
        }
        Request::Unlink { pinum, name } => format!("{} {pinum} {name}", Verb::Unlink).into_bytes(),
        Request::Write { inum, block, data } => {
            let header = format!("{} {inum} {block}", Verb::Write);
            let mut frame = Vec::with_capacity(header.len() + 1 + FS_BLOCK_SIZE);
            frame.extend_from_slice(header.as_bytes());
            frame.push(0);
            frame.extend_from_slice(&data[..]);
            frame
        }
        Request::Read { inum, block } => format!("{} {inum} {block}", Verb::Read).into_bytes(),
        Request::Shutdown => Verb::Shutdown.to_string().into_bytes(),
    }
}

impl Reply {
    /// Encodes a reply into a datagram.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Inum(ino) => ino.to_string().into_bytes(),
            Self::Stat(stat) => {
                format!("{} {} {}", stat.kind as i32, stat.size, stat.addr0).into_bytes()
            }
            Self::Ok => b"0".to_vec(),
            Self::Block(data) => {
                let mut frame = Vec::with_capacity(1 + FS_BLOCK_SIZE);
                frame.push(READ_OK);
                frame.extend_from_slice(&data[..]);
                frame
            }
            Self::Failure => FAILURE.to_vec(),
        }
    }

    /// Decodes a LOOKUP reply: the inum, or `None` on server failure.
    pub fn parse_inum(frame: &[u8]) -> Result<Option<u32>, ProtocolError> {
        match Self::parse_int(frame)? {
            -1 => Ok(None),
            n if n >= 0 => Ok(Some(n as u32)),
            _ => Err(ProtocolError::MalformedReply),
        }
    }

    /// Decodes a CREAT/UNLINK/WRITE/SHUTDOWN reply: `true` on success.
    pub fn parse_ack(frame: &[u8]) -> Result<bool, ProtocolError> {
        match Self::parse_int(frame)? {
            0 => Ok(true),
            -1 => Ok(false),
            _ => Err(ProtocolError::MalformedReply),
        }
    }

    /// Decodes a STAT reply, `None` on server failure.
    pub fn parse_stat(frame: &[u8]) -> Result<Option<Stat>, ProtocolError> {
        let text = str::from_utf8(frame).map_err(|_| ProtocolError::MalformedReply)?;
        if text == "-1" {
            return Ok(None);
        }
        let mut tokens = text.split(' ');
        let code = int_arg(&mut tokens).map_err(|_| ProtocolError::MalformedReply)?;
        let kind = FileKind::from_repr(code).ok_or(ProtocolError::MalformedReply)?;
        let size = int_arg(&mut tokens).map_err(|_| ProtocolError::MalformedReply)?;
        let addr0 = int_arg(&mut tokens).map_err(|_| ProtocolError::MalformedReply)?;
        finish(tokens).map_err(|_| ProtocolError::MalformedReply)?;
        if size < 0 {
            return Err(ProtocolError::MalformedReply);
        }
        Ok(Some(Stat {
            kind,
            size: size as u32,
            addr0,
        }))
    }

    /// Decodes a READ reply, `None` on server failure.
    pub fn parse_block(frame: &[u8]) -> Result<Option<Box<[u8; FS_BLOCK_SIZE]>>, ProtocolError> {
        if frame == FAILURE {
            return Ok(None);
        }
        let (&status, payload) = frame.split_first().ok_or(ProtocolError::MalformedReply)?;
        if status != READ_OK {
            return Err(ProtocolError::MalformedReply);
        }
        let data: &[u8; FS_BLOCK_SIZE] = payload
            .try_into()
            .map_err(|_| ProtocolError::MalformedReply)?;
        Ok(Some(Box::new(*data)))
    }

    fn parse_int(frame: &[u8]) -> Result<i32, ProtocolError> {
        let text = str::from_utf8(frame).map_err(|_| ProtocolError::MalformedReply)?;
        i32::from_str(text).map_err(|_| ProtocolError::MalformedReply)
    }
}
