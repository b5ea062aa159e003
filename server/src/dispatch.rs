//! Request dispatch: parse the frame, route to the engine, encode the
//! reply.
//!
//! Persist-then-reply lives here and nowhere else: every mutating verb
//! goes through one `sync` before its reply is produced, so no handler
//! can forget to flush. Non-fatal errors all collapse to the generic
//! `-1` reply; a host I/O error propagates out and takes the server
//! down.

use mfs_fs_types::{T_DIR, T_FILE};
use mfs_protocol::{FAILURE, FileKind, ProtocolError, Reply, Request, Stat, parse_request};

use crate::{error::ServerError, fs::FileSystem};

/// What the loop should do once the reply has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Shutdown,
}

/// Handles one request frame, returning the reply datagram. `Err` is
/// fatal; request-level failures are already encoded in the reply.
pub fn dispatch(fs: &mut FileSystem, frame: &[u8]) -> Result<(Vec<u8>, Action), ServerError> {
    let req = match parse_request(frame) {
        Ok(req) => req,
        Err(err) => {
            log_rejected(&err);
            return Ok((FAILURE.to_vec(), Action::Continue));
        }
    };

    let (reply, action) = match handle(fs, &req) {
        Ok(done) => done,
        Err(ServerError::Fs(err)) => {
            eprintln!("mfs-server: request failed: {err}");
            (Reply::Failure, Action::Continue)
        }
        Err(err) => return Err(err),
    };
    Ok((reply.encode(), action))
}

fn handle(fs: &mut FileSystem, req: &Request<'_>) -> Result<(Reply, Action), ServerError> {
    let reply = match *req {
        Request::Lookup { pinum, name } => {
            let ino = fs.lookup(pinum, name)?;
            Reply::Inum(ino.value())
        }
        Request::Stat { inum } => {
            let stat = fs.stat(inum)?;
            Reply::Stat(Stat {
                kind: wire_kind(stat.ty),
                size: stat.size,
                addr0: stat.addr0,
            })
        }
        Request::Creat { pinum, kind, name } => {
            fs.creat(pinum, disk_type(kind), name)?;
            fs.sync()?;
            Reply::Ok
        }
        Request::Unlink { pinum, name } => {
            fs.unlink(pinum, name)?;
            fs.sync()?;
            Reply::Ok
        }
        Request::Write { inum, block, data } => {
            fs.write(inum, data, block)?;
            fs.sync()?;
            Reply::Ok
        }
        Request::Read { inum, block } => {
            let data = fs.read(inum, block)?;
            Reply::Block(data)
        }
        Request::Shutdown => {
            fs.sync()?;
            return Ok((Reply::Ok, Action::Shutdown));
        }
    };
    Ok((reply, Action::Continue))
}

fn log_rejected(err: &ProtocolError) {
    eprintln!("mfs-server: malformed request: {err}");
}

fn wire_kind(ty: i32) -> FileKind {
    match ty {
        T_DIR => FileKind::Directory,
        T_FILE => FileKind::Regular,
        _ => unreachable!("stat of a free inode slot"),
    }
}

fn disk_type(kind: FileKind) -> i32 {
    match kind {
        FileKind::Directory => T_DIR,
        FileKind::Regular => T_FILE,
    }
}
