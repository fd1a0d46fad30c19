//! File endpoints: regular files, stdin and stdout.

use crate::endpoint::{
    ConnectionStatus, Endpoint, EndpointKind, EndpointResult, Handle, MediaPacket, ReadOutcome,
    Source, Target, TransportStats,
};
use crate::uri::MediaUri;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use tracing::debug;

/// Put a descriptor into non-blocking mode, returning its previous flags.
fn set_nonblocking(fd: RawFd) -> io::Result<libc::c_int> {
    // SAFETY: fcntl on a descriptor we own; F_GETFL/F_SETFL take no pointers.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(flags)
    }
}

/// Put back the status flags saved by [`set_nonblocking`].
fn restore_flags(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads a file, or stdin for `file://con` / `-`.
///
/// Once end of file is reached the source reports itself closed; it is not
/// reopened.
pub struct FileSource {
    file: File,
    // Flags of a descriptor shared with the process (stdin), restored on drop
    saved_flags: Option<libc::c_int>,
    exhausted: bool,
    buf: Vec<u8>,
    stats: TransportStats,
}

impl FileSource {
    /// Open the file named by `uri`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened.
    pub fn open(uri: &MediaUri) -> EndpointResult<Self> {
        if uri.is_console() {
            debug!("File source reading stdin");
            return Self::shared(io::stdin().as_fd());
        }
        debug!("File source reading {}", uri.path());
        Ok(Self::from_file(File::open(uri.path())?, None))
    }

    /// Read from a duplicate of `fd`. The duplicate shares the open file
    /// description, so the original flags come back when the source drops.
    fn shared(fd: BorrowedFd<'_>) -> EndpointResult<Self> {
        let fd: OwnedFd = fd.try_clone_to_owned()?;
        let flags = set_nonblocking(fd.as_raw_fd())?;
        Ok(Self::from_file(File::from(fd), Some(flags)))
    }

    fn from_file(file: File, saved_flags: Option<libc::c_int>) -> Self {
        Self {
            file,
            saved_flags,
            exhausted: false,
            buf: Vec::new(),
            stats: TransportStats::new(),
        }
    }
}

impl Drop for FileSource {
    fn drop(&mut self) {
        if let Some(flags) = self.saved_flags {
            if let Err(e) = restore_flags(self.file.as_raw_fd(), flags) {
                debug!("restoring stdin flags: {}", e);
            }
        }
    }
}

impl Endpoint for FileSource {
    fn kind(&self) -> EndpointKind {
        EndpointKind::File
    }

    fn is_open(&self) -> bool {
        !self.exhausted
    }

    fn status(&mut self) -> ConnectionStatus {
        if self.exhausted {
            ConnectionStatus::Closed
        } else {
            ConnectionStatus::Connected
        }
    }

    fn handles(&self) -> Vec<Handle> {
        vec![Handle::native(self.file.as_raw_fd())]
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl Source for FileSource {
    fn read(&mut self, max_chunk: usize) -> EndpointResult<ReadOutcome> {
        if self.exhausted {
            return Ok(ReadOutcome::EndOfStream);
        }
        if self.buf.len() < max_chunk {
            self.buf.resize(max_chunk, 0);
        }

        loop {
            match self.file.read(&mut self.buf[..max_chunk]) {
                Ok(0) => {
                    self.exhausted = true;
                    return Ok(ReadOutcome::EndOfStream);
                }
                Ok(n) => {
                    self.stats.record_recv(n);
                    return Ok(ReadOutcome::Data(MediaPacket::new(
                        self.buf[..n].to_vec(),
                        None,
                    )));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stats.record_recv_error();
                    return Err(e.into());
                }
            }
        }
    }
}

enum Output {
    File(File),
    Stdout(io::Stdout),
}

/// Writes to a file (created or truncated), or stdout for `file://con` / `-`.
pub struct FileTarget {
    output: Output,
    stats: TransportStats,
}

impl FileTarget {
    /// Create the file named by `uri`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created.
    pub fn open(uri: &MediaUri) -> EndpointResult<Self> {
        let output = if uri.is_console() {
            debug!("File target writing stdout");
            Output::Stdout(io::stdout())
        } else {
            debug!("File target writing {}", uri.path());
            Output::File(File::create(uri.path())?)
        };

        Ok(Self {
            output,
            stats: TransportStats::new(),
        })
    }
}

impl Endpoint for FileTarget {
    fn kind(&self) -> EndpointKind {
        EndpointKind::File
    }

    fn is_open(&self) -> bool {
        true
    }

    fn status(&mut self) -> ConnectionStatus {
        ConnectionStatus::Connected
    }

    fn handles(&self) -> Vec<Handle> {
        let raw = match &self.output {
            Output::File(file) => file.as_raw_fd(),
            Output::Stdout(stdout) => stdout.as_raw_fd(),
        };
        vec![Handle::native(raw)]
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl Target for FileTarget {
    fn write(&mut self, payload: &[u8], _time: Option<u64>) -> EndpointResult<()> {
        let result = match &mut self.output {
            Output::File(file) => file.write_all(payload),
            Output::Stdout(stdout) => {
                let mut lock = stdout.lock();
                lock.write_all(payload).and_then(|()| lock.flush())
            }
        };

        match result {
            Ok(()) => {
                self.stats.record_send(payload.len());
                Ok(())
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(e.into())
            }
        }
    }
}
