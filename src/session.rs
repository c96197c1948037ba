//! The request loop: framed FUSE requests in, framed replies out.
//!
//! Exactly two names resolve under the mount root. Reading the package file
//! pulls blocks through the store on demand; a stat or lookup of the exit
//! flag shuts the server down once the reply has been flushed.

use std::ffi::CStr;
use std::fs::File;
use std::io::{ErrorKind, IoSlice, Read, Write};
use std::mem::size_of;

use anyhow::{bail, Context};
use bytemuck::{pod_read_unaligned, Zeroable};
use libc::{S_IFDIR, S_IFREG};
use nix::errno::Errno;
use smallvec::SmallVec;
use tracing::{debug, error, warn};

use crate::fuse::{self, Attr, AttrOut, EntryOut, InHeader, InitIn, InitOut, OpenOut, OutHeader, ReadIn};
use crate::provider::BlockProvider;
use crate::store::BlockStore;

pub const PACKAGE_NAME: &str = "package.zip";
pub const EXIT_NAME: &str = "exit";

pub const PACKAGE_ID: u64 = fuse::ROOT_ID + 1;
pub const EXIT_ID: u64 = fuse::ROOT_ID + 2;

/// There is no per-open state, so every open gets the same handle.
const FILE_HANDLE: u64 = 10;

/// How long the kernel may cache entries and attributes, in seconds.
const CACHE_TIMEOUT: u64 = 10;

const RECV_BUF_SIZE: usize = size_of::<InHeader>() + 8 * libc::PATH_MAX as usize;

/// What a handler wants the dispatcher to do once it returns.
enum Reply {
    /// The handler already wrote its framed reply.
    Sent,
    /// Reply written; terminate the request loop successfully.
    SentExit,
    /// Send a header-only success reply.
    Empty,
    /// Send a header-only error reply.
    Error(Errno),
    /// Send the error reply, then abort the loop with failure.
    Fatal(Errno),
}

pub struct Session<'a> {
    control: File,
    provider: &'a mut dyn BlockProvider,
    store: BlockStore,
    uid: u32,
    gid: u32,
}

impl<'a> Session<'a> {
    pub fn new(
        control: File,
        provider: &'a mut dyn BlockProvider,
        store: BlockStore,
        uid: u32,
        gid: u32,
    ) -> Self {
        Self {
            control,
            provider,
            store,
            uid,
            gid,
        }
    }

    /// Serve requests until the exit flag is touched (Ok), the kernel tears
    /// the mount down, or version negotiation fails (Err).
    pub fn run(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            let len = match self.control.read(&mut buf) {
                Ok(0) => bail!("control channel closed"),
                Ok(len) => len,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.raw_os_error() == Some(libc::ENODEV) => {
                    return Err(err).context("mount torn down by the kernel");
                }
                Err(err) => {
                    warn!("request read failed: {err}");
                    continue;
                }
            };
            if len < size_of::<InHeader>() {
                warn!("request frame too short: {len} bytes");
                continue;
            }
            let hdr: InHeader = pod_read_unaligned(&buf[..size_of::<InHeader>()]);
            let payload = &buf[size_of::<InHeader>()..len];

            let reply = match hdr.opcode {
                fuse::INIT => self.handle_init(&hdr, payload),
                fuse::LOOKUP => self.handle_lookup(&hdr, payload),
                fuse::GETATTR => self.handle_getattr(&hdr),
                fuse::OPEN => self.handle_open(&hdr),
                fuse::READ => self.handle_read(&hdr, payload),
                fuse::FLUSH | fuse::RELEASE => Reply::Empty,
                opcode => {
                    warn!("unsupported opcode {opcode}");
                    Reply::Error(Errno::ENOSYS)
                }
            };

            match reply {
                Reply::Sent => {}
                Reply::SentExit => {
                    debug!("exit flag touched, shutting down");
                    return Ok(());
                }
                Reply::Empty => write_status(&self.control, hdr.unique, 0),
                Reply::Error(errno) => write_status(&self.control, hdr.unique, -(errno as i32)),
                Reply::Fatal(errno) => {
                    write_status(&self.control, hdr.unique, -(errno as i32));
                    bail!("fuse protocol negotiation failed");
                }
            }
        }
    }

    fn handle_init(&mut self, hdr: &InHeader, payload: &[u8]) -> Reply {
        if payload.len() < size_of::<InitIn>() {
            return Reply::Error(Errno::EINVAL);
        }
        let req: InitIn = pod_read_unaligned(&payload[..size_of::<InitIn>()]);
        if req.major != fuse::KERNEL_VERSION || req.minor < 6 {
            error!(
                "kernel speaks fuse {}.{}, need {}.6 or newer",
                req.major,
                req.minor,
                fuse::KERNEL_VERSION
            );
            return Reply::Fatal(Errno::EPROTO);
        }

        let minor = req.minor.min(fuse::KERNEL_MINOR_VERSION);
        let mut out = InitOut::zeroed();
        out.major = fuse::KERNEL_VERSION;
        out.minor = minor;
        out.max_readahead = req.max_readahead;
        out.flags = 0;
        out.max_background = 32;
        out.congestion_threshold = 32;
        out.max_write = 4096;

        // Kernels on minor revs <= 22 expect the original 24-byte layout.
        let size = if minor <= 22 {
            fuse::COMPAT_22_INIT_OUT_SIZE
        } else {
            size_of::<InitOut>()
        };
        write_reply(&self.control, hdr.unique, &[&bytemuck::bytes_of(&out)[..size]]);
        Reply::Sent
    }

    fn handle_lookup(&mut self, hdr: &InHeader, payload: &[u8]) -> Reply {
        let Ok(name) = CStr::from_bytes_until_nul(payload) else {
            return Reply::Error(Errno::ENOENT);
        };

        let mut out = EntryOut::zeroed();
        out.entry_valid = CACHE_TIMEOUT;
        out.attr_valid = CACHE_TIMEOUT;
        if name.to_bytes() == PACKAGE_NAME.as_bytes() {
            out.nodeid = PACKAGE_ID;
            out.generation = PACKAGE_ID;
            out.attr = self.attr(PACKAGE_ID, self.store.file_size(), S_IFREG | 0o444);
        } else if name.to_bytes() == EXIT_NAME.as_bytes() {
            out.nodeid = EXIT_ID;
            out.generation = EXIT_ID;
            out.attr = self.attr(EXIT_ID, 0, S_IFREG);
        } else {
            return Reply::Error(Errno::ENOENT);
        }

        write_reply(&self.control, hdr.unique, &[bytemuck::bytes_of(&out)]);
        if out.nodeid == EXIT_ID {
            Reply::SentExit
        } else {
            Reply::Sent
        }
    }

    fn handle_getattr(&mut self, hdr: &InHeader) -> Reply {
        let mut out = AttrOut::zeroed();
        out.attr_valid = CACHE_TIMEOUT;
        out.attr = match hdr.nodeid {
            fuse::ROOT_ID => self.attr(fuse::ROOT_ID, 4096, S_IFDIR | 0o555),
            PACKAGE_ID => self.attr(PACKAGE_ID, self.store.file_size(), S_IFREG | 0o444),
            EXIT_ID => self.attr(EXIT_ID, 0, S_IFREG),
            _ => return Reply::Error(Errno::ENOENT),
        };

        write_reply(&self.control, hdr.unique, &[bytemuck::bytes_of(&out)]);
        if hdr.nodeid == EXIT_ID {
            Reply::SentExit
        } else {
            Reply::Sent
        }
    }

    fn handle_open(&mut self, hdr: &InHeader) -> Reply {
        if hdr.nodeid == EXIT_ID {
            return Reply::Error(Errno::EPERM);
        }
        if hdr.nodeid != PACKAGE_ID {
            return Reply::Error(Errno::ENOENT);
        }
        let mut out = OpenOut::zeroed();
        out.fh = FILE_HANDLE;
        write_reply(&self.control, hdr.unique, &[bytemuck::bytes_of(&out)]);
        Reply::Sent
    }

    fn handle_read(&mut self, hdr: &InHeader, payload: &[u8]) -> Reply {
        if hdr.nodeid != PACKAGE_ID {
            return Reply::Error(Errno::ENOENT);
        }
        if payload.len() < size_of::<ReadIn>() {
            return Reply::Error(Errno::EINVAL);
        }
        let req: ReadIn = pod_read_unaligned(&payload[..size_of::<ReadIn>()]);
        let offset = req.offset;
        let size = req.size as usize;
        let block_size = self.store.block_size() as usize;

        // max_read is negotiated to the block size, so no honest request
        // spans more than two blocks.
        if size > block_size {
            return Reply::Error(Errno::EINVAL);
        }

        let block = offset / block_size as u64;
        let block_offset = (offset % block_size as u64) as usize;
        if let Err(errno) = self.store.ensure_block(&mut *self.provider, block) {
            return Reply::Error(errno);
        }

        // Replies always carry exactly `size` bytes; reads past the end of
        // the file are zero-padded rather than shortened, because consumers
        // that mmap the file fault whole pages in.
        if block_offset + size <= block_size {
            let data = &self.store.current()[block_offset..block_offset + size];
            write_reply(&self.control, hdr.unique, &[data]);
        } else {
            // The read straddles into the next block: park the tail of this
            // one in the spill buffer, then pull its successor in.
            self.store.spill_tail(block_offset);
            if let Err(errno) = self.store.ensure_block(&mut *self.provider, block + 1) {
                return Reply::Error(errno);
            }
            let first = &self.store.spill()[..block_size - block_offset];
            let second = &self.store.current()[..size - first.len()];
            write_reply(&self.control, hdr.unique, &[first, second]);
        }
        Reply::Sent
    }

    fn attr(&self, nodeid: u64, size: u64, mode: u32) -> Attr {
        let mut attr = Attr::zeroed();
        attr.ino = nodeid;
        attr.size = size;
        attr.blocks = if size == 0 { 0 } else { (size - 1) / 4096 + 1 };
        attr.mode = mode;
        attr.nlink = 1;
        attr.uid = self.uid;
        attr.gid = self.gid;
        attr.blksize = 4096;
        attr
    }
}

/// One writev per reply: header plus up to two payload segments, so read
/// data never has to be copied into a contiguous buffer first.
fn write_reply(mut control: &File, unique: u64, segments: &[&[u8]]) {
    let len = size_of::<OutHeader>() + segments.iter().map(|s| s.len()).sum::<usize>();
    let hdr = OutHeader {
        len: len as u32,
        error: 0,
        unique,
    };
    let hdr_bytes = bytemuck::bytes_of(&hdr);
    let mut iov: SmallVec<[IoSlice; 3]> = SmallVec::new();
    iov.push(IoSlice::new(hdr_bytes));
    for segment in segments {
        iov.push(IoSlice::new(segment));
    }
    loop {
        match control.write_vectored(&iov) {
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => error!("reply for request {unique} failed: {err}"),
            Ok(_) => {}
        }
        break;
    }
}

fn write_status(mut control: &File, unique: u64, error: i32) {
    let hdr = OutHeader {
        len: size_of::<OutHeader>() as u32,
        error,
        unique,
    };
    loop {
        match control.write_all(bytemuck::bytes_of(&hdr)) {
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => error!("status reply for request {unique} failed: {err}"),
            Ok(()) => {}
        }
        break;
    }
}
