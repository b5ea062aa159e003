//! The MFS server: a user-level file system stored in a single image
//! file, served to remote clients over UDP.
//!
//! One datagram is one request. The [`net`] loop receives a frame,
//! [`dispatch`] parses and routes it to the [`fs`] engine, and the
//! reply goes back to the sender. Mutating requests are flushed to
//! stable storage before the reply is sent.

pub mod dispatch;
pub mod error;
pub mod fs;
pub mod image;
pub mod net;
