//! CFMessagePort transport (macOS)
//!
//! Requests use a remote port created from the daemon-supplied name;
//! `CFMessagePortSendRequest` with a reply mode blocks for the answer.
//! Notifications arrive on a local port whose callback copies each message
//! into a queue. `poll_once` attaches the port's run-loop source to the
//! calling thread's run loop (once) and runs that loop for one slice.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use core_foundation::base::TCFType;
use core_foundation::string::CFString;
use core_foundation_sys::base::{
    kCFAllocatorDefault, Boolean, CFAllocatorRef, CFIndex, CFRelease, CFTypeRef,
};
use core_foundation_sys::data::{CFDataCreate, CFDataGetBytePtr, CFDataGetLength, CFDataRef};
use core_foundation_sys::date::CFTimeInterval;
use core_foundation_sys::runloop::{
    kCFRunLoopDefaultMode, kCFRunLoopRunHandledSource, kCFRunLoopRunTimedOut, CFRunLoopAddSource,
    CFRunLoopContainsSource, CFRunLoopGetCurrent, CFRunLoopRemoveSource, CFRunLoopRef,
    CFRunLoopRunInMode, CFRunLoopSourceRef,
};
use core_foundation_sys::string::CFStringRef;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::types::{ChannelRole, PollOutcome};
use crate::{Channel, Transport, TransportOptions};

#[repr(C)]
struct OpaqueMessagePort(c_void);
type CFMessagePortRef = *mut OpaqueMessagePort;

type CFMessagePortCallBack = extern "C" fn(
    local: CFMessagePortRef,
    msgid: i32,
    data: CFDataRef,
    info: *mut c_void,
) -> CFDataRef;

#[repr(C)]
struct CFMessagePortContext {
    version: CFIndex,
    info: *mut c_void,
    retain: Option<extern "C" fn(*const c_void) -> *const c_void>,
    release: Option<extern "C" fn(*const c_void)>,
    copy_description: Option<extern "C" fn(*const c_void) -> CFStringRef>,
}

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    fn CFMessagePortCreateLocal(
        allocator: CFAllocatorRef,
        name: CFStringRef,
        callout: CFMessagePortCallBack,
        context: *mut CFMessagePortContext,
        should_free_info: *mut Boolean,
    ) -> CFMessagePortRef;
    fn CFMessagePortCreateRemote(allocator: CFAllocatorRef, name: CFStringRef) -> CFMessagePortRef;
    fn CFMessagePortSendRequest(
        remote: CFMessagePortRef,
        msgid: i32,
        data: CFDataRef,
        send_timeout: CFTimeInterval,
        rcv_timeout: CFTimeInterval,
        reply_mode: CFStringRef,
        return_data: *mut CFDataRef,
    ) -> i32;
    fn CFMessagePortCreateRunLoopSource(
        allocator: CFAllocatorRef,
        local: CFMessagePortRef,
        order: CFIndex,
    ) -> CFRunLoopSourceRef;
    fn CFMessagePortInvalidate(port: CFMessagePortRef);
}

/// CFMessagePortSendRequest status codes
mod status {
    pub const SUCCESS: i32 = 0;
    pub const SEND_TIMEOUT: i32 = -1;
    pub const RECEIVE_TIMEOUT: i32 = -2;
    pub const IS_INVALID: i32 = -3;
    pub const BECAME_INVALID: i32 = -5;
}

/// Message-port transport
pub struct MessagePortTransport {
    options: TransportOptions,
}

impl MessagePortTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

impl Transport for MessagePortTransport {
    fn open(&self, name: &str, role: ChannelRole) -> Result<Box<dyn Channel>, TransportError> {
        debug!("Opening {} port {}", role.as_str(), name);
        match role {
            ChannelRole::Remote => Ok(Box::new(RemotePortChannel::open(name, self.options)?)),
            ChannelRole::Local => Ok(Box::new(LocalPortChannel::create(name, self.options)?)),
        }
    }

    fn kind(&self) -> &'static str {
        "message-port"
    }
}

fn data_to_vec(data: CFDataRef) -> Vec<u8> {
    if data.is_null() {
        return Vec::new();
    }
    unsafe {
        let len = CFDataGetLength(data).max(0) as usize;
        let ptr = CFDataGetBytePtr(data);
        if ptr.is_null() || len == 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts(ptr, len).to_vec()
    }
}

struct RemotePortChannel {
    name: String,
    port: Mutex<CFMessagePortRef>,
    options: TransportOptions,
}

// The port is only touched under the mutex
unsafe impl Send for RemotePortChannel {}
unsafe impl Sync for RemotePortChannel {}

impl RemotePortChannel {
    fn open(name: &str, options: TransportOptions) -> Result<Self, TransportError> {
        let cf_name = CFString::new(name);
        let port =
            unsafe { CFMessagePortCreateRemote(kCFAllocatorDefault, cf_name.as_concrete_TypeRef()) };
        if port.is_null() {
            return Err(TransportError::ChannelNotFound(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            port: Mutex::new(port),
            options,
        })
    }
}

impl Channel for RemotePortChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> ChannelRole {
        ChannelRole::Remote
    }

    fn exchange(&self, message: &[u8], want_reply: bool) -> Result<Vec<u8>, TransportError> {
        let port = self.port.lock();
        let timeout = self.options.reply_timeout.as_secs_f64();

        let data = unsafe {
            CFDataCreate(kCFAllocatorDefault, message.as_ptr(), message.len() as CFIndex)
        };
        if data.is_null() {
            return Err(TransportError::Internal("CFDataCreate returned null".into()));
        }

        let mut reply: CFDataRef = ptr::null();
        let rc = unsafe {
            CFMessagePortSendRequest(
                *port,
                0,
                data,
                timeout,
                if want_reply { timeout } else { 0.0 },
                if want_reply {
                    kCFRunLoopDefaultMode
                } else {
                    ptr::null()
                },
                if want_reply {
                    &mut reply as *mut CFDataRef
                } else {
                    ptr::null_mut()
                },
            )
        };
        unsafe { CFRelease(data as CFTypeRef) };

        match rc {
            status::SUCCESS => {
                let bytes = data_to_vec(reply);
                if !reply.is_null() {
                    unsafe { CFRelease(reply as CFTypeRef) };
                }
                trace!("{}: {} bytes out, {} bytes back", self.name, message.len(), bytes.len());
                Ok(bytes)
            }
            status::SEND_TIMEOUT | status::RECEIVE_TIMEOUT => Err(TransportError::Timeout),
            status::IS_INVALID | status::BECAME_INVALID => Err(TransportError::Disconnected),
            code => Err(TransportError::Os {
                op: "CFMessagePortSendRequest",
                code: code as u32,
            }),
        }
    }

    fn poll_once(&self) -> Result<PollOutcome, TransportError> {
        Err(TransportError::WrongRole(ChannelRole::Remote.as_str()))
    }
}

impl Drop for RemotePortChannel {
    fn drop(&mut self) {
        let port = *self.port.get_mut();
        unsafe {
            CFMessagePortInvalidate(port);
            CFRelease(port as CFTypeRef);
        }
    }
}

type Inbox = Arc<Mutex<VecDeque<Vec<u8>>>>;

extern "C" fn on_message(
    _local: CFMessagePortRef,
    _msgid: i32,
    data: CFDataRef,
    info: *mut c_void,
) -> CFDataRef {
    if info.is_null() {
        return ptr::null();
    }
    // info points at the Inbox owned by the LocalPortChannel
    let inbox = unsafe { &*(info as *const Mutex<VecDeque<Vec<u8>>>) };
    inbox.lock().push_back(data_to_vec(data));
    ptr::null()
}

struct LocalPortChannel {
    name: String,
    port: CFMessagePortRef,
    source: CFRunLoopSourceRef,
    /// Run loop the source was last attached to
    attached: Mutex<Option<CFRunLoopRef>>,
    inbox: Inbox,
    options: TransportOptions,
}

// Run-loop calls are made from whichever thread polls; the inbox is locked
unsafe impl Send for LocalPortChannel {}
unsafe impl Sync for LocalPortChannel {}

impl LocalPortChannel {
    fn create(name: &str, options: TransportOptions) -> Result<Self, TransportError> {
        let inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
        let mut context = CFMessagePortContext {
            version: 0,
            info: Arc::as_ptr(&inbox) as *mut c_void,
            retain: None,
            release: None,
            copy_description: None,
        };

        let cf_name = CFString::new(name);
        let mut should_free: Boolean = 0;
        let port = unsafe {
            CFMessagePortCreateLocal(
                kCFAllocatorDefault,
                cf_name.as_concrete_TypeRef(),
                on_message,
                &mut context,
                &mut should_free,
            )
        };
        if port.is_null() {
            return Err(TransportError::Internal(format!(
                "CFMessagePortCreateLocal failed for {name}"
            )));
        }

        let source = unsafe { CFMessagePortCreateRunLoopSource(kCFAllocatorDefault, port, 0) };
        if source.is_null() {
            unsafe {
                CFMessagePortInvalidate(port);
                CFRelease(port as CFTypeRef);
            }
            return Err(TransportError::Internal(
                "CFMessagePortCreateRunLoopSource failed".into(),
            ));
        }

        Ok(Self {
            name: name.to_string(),
            port,
            source,
            attached: Mutex::new(None),
            inbox,
            options,
        })
    }

    fn attach_to_current(&self) {
        let mut attached = self.attached.lock();
        unsafe {
            let current = CFRunLoopGetCurrent();
            if CFRunLoopContainsSource(current, self.source, kCFRunLoopDefaultMode) == 0 {
                debug!("Attaching {} to run loop", self.name);
                CFRunLoopAddSource(current, self.source, kCFRunLoopDefaultMode);
            }
            *attached = Some(current);
        }
    }
}

impl Channel for LocalPortChannel {
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
        self.attach_to_current();

        let result = unsafe {
            CFRunLoopRunInMode(
                kCFRunLoopDefaultMode,
                self.options.poll_timeout.as_secs_f64(),
                1,
            )
        };

        let messages: Vec<Vec<u8>> = self.inbox.lock().drain(..).collect();
        if !messages.is_empty() {
            return Ok(PollOutcome::Received(messages));
        }
        match result {
            r if r == kCFRunLoopRunHandledSource => Ok(PollOutcome::Received(Vec::new())),
            r if r == kCFRunLoopRunTimedOut => Ok(PollOutcome::TimedOut),
            other => {
                // Finished/stopped: nothing attached yet or loop stopped externally
                warn!("Run loop for {} returned {}", self.name, other);
                Ok(PollOutcome::TimedOut)
            }
        }
    }
}

impl Drop for LocalPortChannel {
    fn drop(&mut self) {
        unsafe {
            if let Some(run_loop) = *self.attached.get_mut() {
                CFRunLoopRemoveSource(run_loop, self.source, kCFRunLoopDefaultMode);
            }
            CFMessagePortInvalidate(self.port);
            CFRelease(self.source as CFTypeRef);
            CFRelease(self.port as CFTypeRef);
        }
    }
}
