//! Named-pipe transport (Windows)
//!
//! Requests go through a fresh client handle per exchange
//! (`CreateFile` + `TransactNamedPipe`/`WriteFile`). A busy pipe is retried a
//! fixed number of times with a short sleep in between.
//!
//! Notifications arrive on a server pipe that this process creates and the
//! daemon connects to. Receiving is a small overlapped state machine:
//!
//! ```text
//! Disconnected --connect--> Connecting --signaled--> Reading
//!      ^                                               |  ^
//!      +---------------- broken pipe ------------------+  | re-arm read
//!                                                      +--+
//! ```
//!
//! The retry loop and the state machine only talk to the OS through the
//! [`PipeClientIo`] and [`PipeServerIo`] traits, so they are exercised on
//! every platform with scripted fakes. The Win32 implementations live in the
//! `win32` submodule.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::types::{ChannelRole, PollOutcome};
use crate::{Channel, Transport, TransportOptions};

/// Full pipe path for a bare channel name
pub fn pipe_path(name: &str) -> String {
    format!(r"\\.\pipe\{name}")
}

/// Outcome of one failed client attempt
#[derive(Debug)]
pub enum PipeAttemptError {
    /// All pipe instances are in use; worth retrying
    Busy,
    /// Anything else; surfaced immediately
    Failed(TransportError),
}

impl From<TransportError> for PipeAttemptError {
    fn from(e: TransportError) -> Self {
        PipeAttemptError::Failed(e)
    }
}

/// Client side OS seam: one complete request on a fresh handle
pub trait PipeClientIo: Send + Sync {
    fn transact(
        &self,
        path: &str,
        message: &[u8],
        want_reply: bool,
        timeout: Duration,
    ) -> Result<Vec<u8>, PipeAttemptError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// A client was already waiting
    Connected,
    /// Completion will signal the overlapped event
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadCompletion {
    /// The last (or only) fragment of a message
    Data(Vec<u8>),
    /// A fragment; the message continues in the next read
    MoreData(Vec<u8>),
    /// The peer closed its end
    Broken,
}

/// Server side OS seam: one overlapped server pipe instance
pub trait PipeServerIo: Send {
    fn connect(&mut self) -> Result<ConnectStatus, TransportError>;
    fn complete_connect(&mut self) -> Result<(), TransportError>;
    /// Issue an asynchronous read. `Err(Disconnected)` if the peer is gone.
    fn begin_read(&mut self) -> Result<(), TransportError>;
    /// Wait on the pending operation's event
    fn wait(&mut self, timeout: Duration) -> Result<WaitStatus, TransportError>;
    fn complete_read(&mut self) -> Result<ReadCompletion, TransportError>;
    fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Creates the OS objects for pipe channels
pub trait PipeBackend: Send + Sync {
    fn client(&self) -> Arc<dyn PipeClientIo>;
    fn create_server(&self, path: &str) -> Result<Box<dyn PipeServerIo>, TransportError>;
}

/// Named-pipe transport
pub struct NamedPipeTransport {
    backend: Arc<dyn PipeBackend>,
    options: TransportOptions,
}

impl NamedPipeTransport {
    pub fn with_backend(backend: Arc<dyn PipeBackend>, options: TransportOptions) -> Self {
        Self { backend, options }
    }

    /// Transport backed by the Win32 pipe API
    #[cfg(windows)]
    pub fn win32(options: TransportOptions) -> Self {
        Self::with_backend(Arc::new(win32::Win32Backend), options)
    }
}

impl Transport for NamedPipeTransport {
    fn open(&self, name: &str, role: ChannelRole) -> Result<Box<dyn Channel>, TransportError> {
        let path = pipe_path(name);
        debug!("Opening {} pipe {}", role.as_str(), path);
        match role {
            ChannelRole::Remote => Ok(Box::new(PipeRequestChannel {
                name: name.to_string(),
                path,
                io: self.backend.client(),
                options: self.options,
                send_lock: Mutex::new(()),
            })),
            ChannelRole::Local => {
                let io = self.backend.create_server(&path)?;
                Ok(Box::new(PipeNotificationChannel {
                    name: name.to_string(),
                    poll_timeout: self.options.poll_timeout,
                    state: Mutex::new(ServerState::new(io)),
                }))
            }
        }
    }

    fn kind(&self) -> &'static str {
        "named-pipe"
    }
}

/// Client end of a daemon pipe
pub struct PipeRequestChannel {
    name: String,
    path: String,
    io: Arc<dyn PipeClientIo>,
    options: TransportOptions,
    send_lock: Mutex<()>,
}

impl Channel for PipeRequestChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> ChannelRole {
        ChannelRole::Remote
    }

    fn exchange(&self, message: &[u8], want_reply: bool) -> Result<Vec<u8>, TransportError> {
        let _guard = self.send_lock.lock();
        let attempts = self.options.busy_retries.max(1);

        for attempt in 1..=attempts {
            match self
                .io
                .transact(&self.path, message, want_reply, self.options.reply_timeout)
            {
                Ok(reply) => {
                    trace!("{}: {} bytes out, {} bytes back", self.name, message.len(), reply.len());
                    return Ok(reply);
                }
                Err(PipeAttemptError::Busy) => {
                    debug!("Pipe {} busy (attempt {}/{})", self.name, attempt, attempts);
                    if attempt < attempts {
                        std::thread::sleep(self.options.busy_backoff);
                    }
                }
                Err(PipeAttemptError::Failed(e)) => return Err(e),
            }
        }

        warn!("Pipe {} still busy after {} attempts", self.name, attempts);
        Err(TransportError::Busy { attempts })
    }

    fn poll_once(&self) -> Result<PollOutcome, TransportError> {
        Err(TransportError::WrongRole(ChannelRole::Remote.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Reading,
}

/// Overlapped receive state for one server pipe
struct ServerState {
    io: Box<dyn PipeServerIo>,
    phase: Phase,
    /// Fragments of a message larger than the read buffer
    partial: Vec<u8>,
}

impl ServerState {
    fn new(io: Box<dyn PipeServerIo>) -> Self {
        Self {
            io,
            phase: Phase::Disconnected,
            partial: Vec::new(),
        }
    }

    /// One poll slice. Any OS error drops the instance back to Disconnected so
    /// the next poll starts a fresh connect.
    fn poll(&mut self, timeout: Duration) -> Result<PollOutcome, TransportError> {
        let result = self.step(timeout);
        if let Err(e) = &result {
            debug!("Notification pipe error in {:?}, resetting: {}", self.phase, e);
            if let Err(de) = self.reset() {
                debug!("Disconnect after error failed: {}", de);
            }
        }
        result
    }

    fn step(&mut self, timeout: Duration) -> Result<PollOutcome, TransportError> {
        if self.phase == Phase::Disconnected {
            match self.io.connect()? {
                ConnectStatus::Connected => return self.start_reading(),
                ConnectStatus::Pending => self.phase = Phase::Connecting,
            }
        }

        if self.io.wait(timeout)? == WaitStatus::TimedOut {
            return Ok(PollOutcome::TimedOut);
        }

        match self.phase {
            Phase::Connecting => match self.io.complete_connect() {
                Ok(()) => self.start_reading(),
                Err(e) => {
                    debug!("Pipe connect did not complete: {}", e);
                    self.reset()?;
                    Ok(PollOutcome::TimedOut)
                }
            },
            Phase::Reading => match self.io.complete_read()? {
                ReadCompletion::Data(bytes) => {
                    self.partial.extend_from_slice(&bytes);
                    let message = std::mem::take(&mut self.partial);
                    self.arm_read()?;
                    Ok(PollOutcome::Received(vec![message]))
                }
                ReadCompletion::MoreData(bytes) => {
                    self.partial.extend_from_slice(&bytes);
                    self.arm_read()?;
                    Ok(PollOutcome::Received(Vec::new()))
                }
                ReadCompletion::Broken => {
                    debug!("Notification pipe peer disconnected");
                    self.reset()?;
                    Ok(PollOutcome::TimedOut)
                }
            },
            Phase::Disconnected => Ok(PollOutcome::TimedOut),
        }
    }

    fn start_reading(&mut self) -> Result<PollOutcome, TransportError> {
        self.phase = Phase::Reading;
        self.arm_read()?;
        Ok(PollOutcome::Received(Vec::new()))
    }

    fn arm_read(&mut self) -> Result<(), TransportError> {
        match self.io.begin_read() {
            Err(TransportError::Disconnected) => self.reset(),
            other => other,
        }
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.partial.clear();
        self.phase = Phase::Disconnected;
        self.io.disconnect()
    }
}

/// Server end that the daemon writes notifications into
pub struct PipeNotificationChannel {
    name: String,
    poll_timeout: Duration,
    state: Mutex<ServerState>,
}

impl Channel for PipeNotificationChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> ChannelRole {
        ChannelRole::Local
    }

    fn exchange(&self, _message: &[u8], _want_reply: bool) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::WrongRole(ChannelRole::Local.as_str()))
    }

    fn poll_once(&self) -> Result<PollOutcome, TransportError> {
        self.state.lock().poll(self.poll_timeout)
    }
}

#[cfg(windows)]
mod win32 {
    use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
    use std::ptr;
    use std::sync::Arc;
    use std::time::Duration;

    use windows_sys::Win32::Foundation::{
        GetLastError, ERROR_BROKEN_PIPE, ERROR_FILE_NOT_FOUND, ERROR_IO_PENDING,
        ERROR_MORE_DATA, ERROR_NO_DATA, ERROR_PIPE_BUSY, ERROR_PIPE_CONNECTED,
        ERROR_PIPE_NOT_CONNECTED, FALSE, GENERIC_READ, GENERIC_WRITE, HANDLE,
        INVALID_HANDLE_VALUE, TRUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
    };
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, OPEN_EXISTING,
        PIPE_ACCESS_INBOUND,
    };
    use windows_sys::Win32::System::Pipes::{
        ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, SetNamedPipeHandleState,
        TransactNamedPipe, PIPE_READMODE_MESSAGE, PIPE_TYPE_MESSAGE, PIPE_UNLIMITED_INSTANCES,
        PIPE_WAIT,
    };
    use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject};
    use windows_sys::Win32::System::IO::{CancelIo, GetOverlappedResult, OVERLAPPED};

    use super::{
        ConnectStatus, PipeAttemptError, PipeBackend, PipeClientIo, PipeServerIo,
        ReadCompletion, WaitStatus,
    };
    use crate::error::TransportError;

    const BUFFER_SIZE: usize = 64 * 1024;

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn os_error(op: &'static str) -> TransportError {
        TransportError::Os {
            op,
            code: unsafe { GetLastError() },
        }
    }

    fn millis(timeout: Duration) -> u32 {
        timeout.as_millis().min(u32::MAX as u128 - 1) as u32
    }

    /// OVERLAPPED block with its own manual-reset event.
    ///
    /// Boxed so its address stays fixed while an operation is in flight.
    struct Overlapped {
        ov: Box<OVERLAPPED>,
        _event: OwnedHandle,
    }

    // The raw event handle inside OVERLAPPED is owned by `_event`
    unsafe impl Send for Overlapped {}

    impl Overlapped {
        fn new() -> Result<Self, TransportError> {
            let event = unsafe { CreateEventW(ptr::null(), TRUE, FALSE, ptr::null()) };
            if event.is_null() {
                return Err(os_error("CreateEventW"));
            }
            let mut ov: Box<OVERLAPPED> = Box::new(unsafe { std::mem::zeroed() });
            ov.hEvent = event;
            Ok(Self {
                ov,
                _event: unsafe { OwnedHandle::from_raw_handle(event) },
            })
        }

        fn event(&self) -> HANDLE {
            self.ov.hEvent
        }

        fn as_mut_ptr(&mut self) -> *mut OVERLAPPED {
            &mut *self.ov
        }

        fn result(&self, handle: HANDLE, wait: bool) -> (bool, u32) {
            let mut transferred = 0u32;
            let ok = unsafe {
                GetOverlappedResult(
                    handle,
                    &*self.ov,
                    &mut transferred,
                    if wait { TRUE } else { FALSE },
                )
            };
            (ok != 0, transferred)
        }
    }

    pub(super) struct Win32Backend;

    impl PipeBackend for Win32Backend {
        fn client(&self) -> Arc<dyn PipeClientIo> {
            Arc::new(Win32Client)
        }

        fn create_server(&self, path: &str) -> Result<Box<dyn PipeServerIo>, TransportError> {
            Ok(Box::new(Win32Server::create(path)?))
        }
    }

    struct Win32Client;

    impl Win32Client {
        fn open(path: &str) -> Result<OwnedHandle, PipeAttemptError> {
            let name = wide(path);
            let handle = unsafe {
                CreateFileW(
                    name.as_ptr(),
                    GENERIC_READ | GENERIC_WRITE,
                    0,
                    ptr::null(),
                    OPEN_EXISTING,
                    FILE_FLAG_OVERLAPPED,
                    ptr::null_mut(),
                )
            };
            if handle == INVALID_HANDLE_VALUE {
                return Err(match unsafe { GetLastError() } {
                    ERROR_PIPE_BUSY => PipeAttemptError::Busy,
                    ERROR_FILE_NOT_FOUND => {
                        TransportError::ChannelNotFound(path.to_string()).into()
                    }
                    code => TransportError::Os {
                        op: "CreateFileW",
                        code,
                    }
                    .into(),
                });
            }
            let handle = unsafe { OwnedHandle::from_raw_handle(handle) };

            let mode = PIPE_READMODE_MESSAGE;
            let ok = unsafe {
                SetNamedPipeHandleState(
                    handle.as_raw_handle(),
                    &mode,
                    ptr::null(),
                    ptr::null(),
                )
            };
            if ok == 0 {
                return Err(os_error("SetNamedPipeHandleState").into());
            }
            Ok(handle)
        }

        /// Wait for an overlapped call issued on `handle`. Returns the bytes
        /// transferred and whether the message has more data.
        fn finish(
            handle: HANDLE,
            ov: &Overlapped,
            issued_ok: bool,
            op: &'static str,
            timeout: Duration,
        ) -> Result<(usize, bool), TransportError> {
            if !issued_ok {
                match unsafe { GetLastError() } {
                    ERROR_IO_PENDING | ERROR_MORE_DATA => {}
                    ERROR_BROKEN_PIPE | ERROR_NO_DATA => return Err(TransportError::Disconnected),
                    code => return Err(TransportError::Os { op, code }),
                }
            }

            match unsafe { WaitForSingleObject(ov.event(), millis(timeout)) } {
                WAIT_OBJECT_0 => {}
                WAIT_TIMEOUT => {
                    unsafe { CancelIo(handle) };
                    let _ = ov.result(handle, true);
                    return Err(TransportError::Timeout);
                }
                _ => return Err(os_error("WaitForSingleObject")),
            }

            let (ok, n) = ov.result(handle, false);
            if ok {
                return Ok((n as usize, false));
            }
            match unsafe { GetLastError() } {
                ERROR_MORE_DATA => Ok((n as usize, true)),
                ERROR_BROKEN_PIPE => Err(TransportError::Disconnected),
                code => Err(TransportError::Os {
                    op: "GetOverlappedResult",
                    code,
                }),
            }
        }
    }

    impl PipeClientIo for Win32Client {
        fn transact(
            &self,
            path: &str,
            message: &[u8],
            want_reply: bool,
            timeout: Duration,
        ) -> Result<Vec<u8>, PipeAttemptError> {
            let pipe = Self::open(path)?;
            let handle = pipe.as_raw_handle();
            let mut ov = Overlapped::new()?;

            if !want_reply {
                let ok = unsafe {
                    WriteFile(
                        handle,
                        message.as_ptr(),
                        message.len() as u32,
                        ptr::null_mut(),
                        ov.as_mut_ptr(),
                    )
                };
                Self::finish(handle, &ov, ok != 0, "WriteFile", timeout)?;
                return Ok(Vec::new());
            }

            let mut reply = vec![0u8; BUFFER_SIZE];
            let ok = unsafe {
                TransactNamedPipe(
                    handle,
                    message.as_ptr().cast(),
                    message.len() as u32,
                    reply.as_mut_ptr().cast(),
                    reply.len() as u32,
                    ptr::null_mut(),
                    ov.as_mut_ptr(),
                )
            };
            let (n, mut more) = Self::finish(handle, &ov, ok != 0, "TransactNamedPipe", timeout)?;
            reply.truncate(n);

            let mut chunk = vec![0u8; BUFFER_SIZE];
            while more {
                let ok = unsafe {
                    ReadFile(
                        handle,
                        chunk.as_mut_ptr(),
                        chunk.len() as u32,
                        ptr::null_mut(),
                        ov.as_mut_ptr(),
                    )
                };
                let (n, again) = Self::finish(handle, &ov, ok != 0, "ReadFile", timeout)?;
                reply.extend_from_slice(&chunk[..n]);
                more = again;
            }
            Ok(reply)
        }
    }

    struct Win32Server {
        pipe: OwnedHandle,
        ov: Overlapped,
        buf: Vec<u8>,
    }

    impl Win32Server {
        fn create(path: &str) -> Result<Self, TransportError> {
            let name = wide(path);
            let handle = unsafe {
                CreateNamedPipeW(
                    name.as_ptr(),
                    PIPE_ACCESS_INBOUND | FILE_FLAG_OVERLAPPED,
                    PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT,
                    PIPE_UNLIMITED_INSTANCES,
                    BUFFER_SIZE as u32,
                    BUFFER_SIZE as u32,
                    0,
                    ptr::null(),
                )
            };
            if handle == INVALID_HANDLE_VALUE {
                return Err(os_error("CreateNamedPipeW"));
            }
            Ok(Self {
                pipe: unsafe { OwnedHandle::from_raw_handle(handle) },
                ov: Overlapped::new()?,
                buf: vec![0u8; BUFFER_SIZE],
            })
        }

        fn handle(&self) -> HANDLE {
            self.pipe.as_raw_handle()
        }
    }

    impl PipeServerIo for Win32Server {
        fn connect(&mut self) -> Result<ConnectStatus, TransportError> {
            let ok = unsafe { ConnectNamedPipe(self.handle(), self.ov.as_mut_ptr()) };
            if ok != 0 {
                return Ok(ConnectStatus::Connected);
            }
            match unsafe { GetLastError() } {
                ERROR_IO_PENDING => Ok(ConnectStatus::Pending),
                ERROR_PIPE_CONNECTED => Ok(ConnectStatus::Connected),
                code => Err(TransportError::Os {
                    op: "ConnectNamedPipe",
                    code,
                }),
            }
        }

        fn complete_connect(&mut self) -> Result<(), TransportError> {
            match self.ov.result(self.handle(), false) {
                (true, _) => Ok(()),
                _ => Err(os_error("ConnectNamedPipe")),
            }
        }

        fn begin_read(&mut self) -> Result<(), TransportError> {
            let handle = self.handle();
            let ok = unsafe {
                ReadFile(
                    handle,
                    self.buf.as_mut_ptr(),
                    self.buf.len() as u32,
                    ptr::null_mut(),
                    self.ov.as_mut_ptr(),
                )
            };
            if ok != 0 {
                return Ok(());
            }
            match unsafe { GetLastError() } {
                ERROR_IO_PENDING | ERROR_MORE_DATA => Ok(()),
                ERROR_BROKEN_PIPE | ERROR_PIPE_NOT_CONNECTED => Err(TransportError::Disconnected),
                code => Err(TransportError::Os {
                    op: "ReadFile",
                    code,
                }),
            }
        }

        fn wait(&mut self, timeout: Duration) -> Result<WaitStatus, TransportError> {
            match unsafe { WaitForSingleObject(self.ov.event(), millis(timeout)) } {
                WAIT_OBJECT_0 => Ok(WaitStatus::Signaled),
                WAIT_TIMEOUT => Ok(WaitStatus::TimedOut),
                _ => Err(os_error("WaitForSingleObject")),
            }
        }

        fn complete_read(&mut self) -> Result<ReadCompletion, TransportError> {
            let (ok, n) = self.ov.result(self.handle(), false);
            let data = self.buf[..n as usize].to_vec();
            if ok {
                return Ok(ReadCompletion::Data(data));
            }
            match unsafe { GetLastError() } {
                ERROR_MORE_DATA => Ok(ReadCompletion::MoreData(data)),
                ERROR_BROKEN_PIPE | ERROR_PIPE_NOT_CONNECTED => Ok(ReadCompletion::Broken),
                code => Err(TransportError::Os {
                    op: "GetOverlappedResult",
                    code,
                }),
            }
        }

        fn disconnect(&mut self) -> Result<(), TransportError> {
            if unsafe { DisconnectNamedPipe(self.handle()) } == 0 {
                return Err(os_error("DisconnectNamedPipe"));
            }
            Ok(())
        }
    }
}
