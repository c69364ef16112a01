//! Framed IPC over Unix stream sockets.
//!
//! A [`Channel`] carries three kinds of payload, always in the order the
//! peers agreed on: text frames (newline-delimited, one argument per line,
//! terminated by a blank line), scalar blobs (u32 big-endian length prefix
//! followed by arbitrary bytes), and passed file descriptors (`SCM_RIGHTS`
//! attached to a one-byte payload).
//!
//! I/O is deliberately unbuffered: a buffered reader could consume the byte
//! that carries a descriptor's ancillary data and silently drop the
//! descriptor. Frames are small, so byte-wise line reads are fine.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};

/// A message channel wrapped around one end of a Unix stream socket.
///
/// Not thread-safe; callers serialize access (the pool server and client
/// both keep channels behind a mutex).
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    /// Wrap an existing stream.
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Create a connected pair of channels. Mostly useful in tests and for
    /// in-process workers.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Borrow the underlying stream.
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Unwrap into the underlying stream.
    pub fn into_stream(self) -> UnixStream {
        self.stream
    }

    /// Write a frame: each argument on its own line, then a blank line.
    ///
    /// Arguments must be non-empty and free of newlines; an empty argument
    /// is indistinguishable from the frame terminator.
    pub fn write_frame(&mut self, args: &[&str]) -> io::Result<()> {
        debug_assert!(!args.is_empty());
        let mut data = String::new();
        for arg in args {
            if arg.is_empty() || arg.contains('\n') {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid frame argument: {:?}", arg),
                ));
            }
            data.push_str(arg);
            data.push('\n');
        }
        data.push('\n');
        self.write_bytes(data.as_bytes())
    }

    /// Read one frame. Returns `None` on a clean EOF before the first byte
    /// of a frame; EOF inside a frame is an error.
    pub fn read_frame(&mut self) -> io::Result<Option<Vec<String>>> {
        let mut args = Vec::new();
        loop {
            let line = match self.read_line()? {
                Some(line) => line,
                None if args.is_empty() => return Ok(None),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside a frame",
                    ))
                }
            };
            if line.is_empty() {
                if args.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "empty frame",
                    ));
                }
                return Ok(Some(args));
            }
            args.push(line);
        }
    }

    /// Write a scalar blob: u32 big-endian length, then the bytes.
    pub fn write_scalar(&mut self, data: &[u8]) -> io::Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "scalar payload too large")
        })?;
        self.write_bytes(&len.to_be_bytes())?;
        self.write_bytes(data)
    }

    /// Read a scalar blob. Returns `None` on a clean EOF before the length
    /// prefix.
    pub fn read_scalar(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut prefix = [0u8; 4];
        if !self.read_exact_or_eof(&mut prefix)? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(prefix) as usize;
        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.read_raw(&mut data[filled..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a scalar",
                ));
            }
            filled += n;
        }
        Ok(Some(data))
    }

    /// Pass a file descriptor to the peer.
    ///
    /// The descriptor rides as `SCM_RIGHTS` ancillary data on a single
    /// dummy byte; the peer must call [`Channel::recv_fd`] at this exact
    /// point in the conversation.
    pub fn send_fd(&mut self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let iov = [IoSlice::new(b"!")];
        let fds = [fd.as_raw_fd()];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        loop {
            match socket::sendmsg::<()>(
                self.stream.as_raw_fd(),
                &iov,
                &cmsg,
                MsgFlags::empty(),
                None,
            ) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    /// Receive a file descriptor passed by the peer.
    pub fn recv_fd(&mut self) -> io::Result<OwnedFd> {
        let mut byte = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut byte)];
        let mut space = cmsg_space!([RawFd; 1]);
        let msg = loop {
            match socket::recvmsg::<()>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut space),
                MsgFlags::empty(),
            ) {
                Ok(msg) => break msg,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        };
        if msg.bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed while receiving a file descriptor",
            ));
        }
        let cmsgs = msg
            .cmsgs()
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        for cmsg in cmsgs {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&fd) = fds.first() {
                    // SCM_RIGHTS installed the descriptor in our table; we
                    // are its sole owner from here on.
                    return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no file descriptor in ancillary data",
        ))
    }

    /// Set the read timeout in milliseconds. Zero disables the timeout.
    /// Reads that time out fail with `WouldBlock`.
    pub fn set_read_timeout_ms(&self, msec: u64) -> io::Result<()> {
        self.stream.set_read_timeout(timeout_from_ms(msec))
    }

    /// Set the write timeout in milliseconds. Zero disables the timeout.
    pub fn set_write_timeout_ms(&self, msec: u64) -> io::Result<()> {
        self.stream.set_write_timeout(timeout_from_ms(msec))
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.read_raw(&mut byte)?;
            if n == 0 {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a line",
                ));
            }
            if byte[0] == b'\n' {
                let text = String::from_utf8(line).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "frame line is not UTF-8")
                })?;
                return Ok(Some(text));
            }
            line.push(byte[0]);
        }
    }

    /// Read into `buf` exactly once, retrying on EINTR.
    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(self.stream.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    /// Fill `buf` completely. `Ok(false)` means a clean EOF before the
    /// first byte.
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_raw(&mut buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-read",
                ));
            }
            filled += n;
        }
        Ok(true)
    }

    /// Write raw bytes, retrying on EINTR and short writes.
    pub(crate) fn write_bytes(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match nix::unistd::write(&self.stream, data) {
                Ok(n) => data = &data[n..],
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
        Ok(())
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn timeout_from_ms(msec: u64) -> Option<Duration> {
    if msec == 0 {
        None
    } else {
        Some(Duration::from_millis(msec))
    }
}
