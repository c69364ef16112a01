//! One request/response conversation with a worker.

use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;

use crate::ipc::Channel;

/// Callback fired exactly once when a [`Session`] is dropped, used by the
/// owning pool to learn that the session closed. Implementations hold a
/// weak reference to the pool and no-op if it is already gone.
pub type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A full-duplex conversation with one worker process.
///
/// The caller sends the request headers and body, half-closes the outbound
/// direction, then reads the response from [`Session::stream`]. Dropping
/// the session notifies the pool that the worker slot is free again; the
/// stream itself may be closed earlier with [`Session::close_stream`]
/// without releasing the slot.
pub struct Session {
    channel: Option<Channel>,
    pid: i32,
    on_close: Option<ReleaseHook>,
}

impl Session {
    /// Wrap a worker stream. `on_close` is fired when the session drops.
    pub fn new(stream: UnixStream, pid: i32, on_close: Option<ReleaseHook>) -> Self {
        Self {
            channel: Some(Channel::new(stream)),
            pid,
            on_close,
        }
    }

    /// The pid of the worker serving this session.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Send the request headers as one length-prefixed CGI blob.
    ///
    /// Build the blob with [`encode_cgi_headers`].
    pub fn send_headers(&mut self, blob: &[u8]) -> io::Result<()> {
        self.channel_mut()?.write_scalar(blob)
    }

    /// Send one block of request body data.
    ///
    /// Bodies are raw bytes; only headers carry framing.
    pub fn send_body_block(&mut self, buf: &[u8]) -> io::Result<()> {
        self.channel_mut()?.write_bytes(buf)
    }

    /// Half-close the outbound direction, signalling end-of-request.
    pub fn shutdown_writer(&mut self) -> io::Result<()> {
        self.channel_mut()?.stream().shutdown(Shutdown::Write)
    }

    /// The inbound stream carrying the worker's response. `None` once
    /// [`Session::close_stream`] has run.
    pub fn stream(&self) -> Option<&UnixStream> {
        self.channel.as_ref().map(Channel::stream)
    }

    /// Drop the owned stream without releasing the pool slot. The slot is
    /// released when the session itself is dropped.
    pub fn close_stream(&mut self) {
        self.channel = None;
    }

    /// Set the stream read timeout in milliseconds (0 disables it).
    pub fn set_reader_timeout(&self, msec: u64) -> io::Result<()> {
        match &self.channel {
            Some(channel) => channel.set_read_timeout_ms(msec),
            None => Ok(()),
        }
    }

    /// Set the stream write timeout in milliseconds (0 disables it).
    pub fn set_writer_timeout(&self, msec: u64) -> io::Result<()> {
        match &self.channel {
            Some(channel) => channel.set_write_timeout_ms(msec),
            None => Ok(()),
        }
    }

    fn channel_mut(&mut self) -> io::Result<&mut Channel> {
        self.channel.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "session stream already closed")
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.pid)
            .field("stream_open", &self.channel.is_some())
            .finish()
    }
}

/// Encode request headers as a CGI name/value blob.
///
/// Names and values alternate, each terminated by a NUL byte. The payload
/// ends with an extra `_\0_\0` sentinel pair so downstream parsers cannot
/// misread a trailing empty value.
pub fn encode_cgi_headers(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(
        pairs.iter().map(|(n, v)| n.len() + v.len() + 2).sum::<usize>() + 4,
    );
    for (name, value) in pairs {
        debug_assert!(!name.as_bytes().contains(&0) && !value.as_bytes().contains(&0));
        blob.extend_from_slice(name.as_bytes());
        blob.push(0);
        blob.extend_from_slice(value.as_bytes());
        blob.push(0);
    }
    blob.extend_from_slice(b"_\0_\0");
    blob
}
