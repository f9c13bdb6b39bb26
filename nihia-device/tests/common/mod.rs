//! In-process fake of the NIHIA daemon

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use nihia_transport::protocol::{
    decode_ack_port, decode_handshake, encode_handshake_reply, message_id, msg, HandshakeReply,
};
use nihia_transport::{
    Channel, ChannelRole, PollOutcome, Transport, TransportError, BOOTSTRAP_PORT_NAME, SUCCESS,
};
use parking_lot::Mutex;

/// How the fake answers handshakes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    Accept,
    /// Bare 4-byte status
    ErrorReply,
    /// Full-length reply with a wrong success code
    Mismatch,
    Silent,
}

#[derive(Default)]
pub struct DaemonState {
    pub handshake_mode: Option<HandshakeMode>,
    pub reject_ack: bool,
    /// Every message received, as (channel, message name)
    pub log: Vec<(String, &'static str)>,
    /// Serials seen in handshakes, in order ("" for global)
    pub handshakes: Vec<String>,
    /// Notification channel names that were acknowledged
    pub acked: Vec<String>,
    /// Pending notifications per notification channel
    pub outbox: HashMap<String, VecDeque<Vec<u8>>>,
    /// Channel names opened, with role
    pub opened: Vec<(String, ChannelRole)>,
}

#[derive(Clone, Default)]
pub struct FakeDaemon {
    pub state: Arc<Mutex<DaemonState>>,
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: HandshakeMode) -> Self {
        let daemon = Self::new();
        daemon.state.lock().handshake_mode = Some(mode);
        daemon
    }

    /// Queue a notification for the channel that serves `serial` ("" = global)
    pub fn notify(&self, serial: &str, message: Vec<u8>) {
        self.state
            .lock()
            .outbox
            .entry(notification_name(serial))
            .or_default()
            .push_back(message);
    }

    /// Message names received on channels whose name contains `fragment`
    pub fn messages_on(&self, fragment: &str) -> Vec<&'static str> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(ch, _)| ch.contains(fragment))
            .map(|(_, m)| *m)
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.state.lock().log.iter().filter(|(_, m)| *m == name).count()
    }

    /// Poll until `cond` holds or two seconds pass
    pub fn wait_for(&self, cond: impl Fn(&DaemonState) -> bool) -> bool {
        for _ in 0..200 {
            if cond(&*self.state.lock()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

pub fn request_name(serial: &str) -> String {
    format!("req-{}", if serial.is_empty() { "global" } else { serial })
}

pub fn notification_name(serial: &str) -> String {
    format!("notif-{}", if serial.is_empty() { "global" } else { serial })
}

impl Transport for FakeDaemon {
    fn open(&self, name: &str, role: ChannelRole) -> Result<Box<dyn Channel>, TransportError> {
        self.state.lock().opened.push((name.to_string(), role));
        Ok(Box::new(FakeChannel {
            name: name.to_string(),
            role,
            state: self.state.clone(),
        }))
    }

    fn kind(&self) -> &'static str {
        "fake"
    }
}

struct FakeChannel {
    name: String,
    role: ChannelRole,
    state: Arc<Mutex<DaemonState>>,
}

impl FakeChannel {
    fn handshake(&self, message: &[u8]) -> Vec<u8> {
        let request = decode_handshake(message).expect("valid handshake");
        let mut state = self.state.lock();
        state.handshakes.push(request.serial.clone());
        match state.handshake_mode.unwrap_or(HandshakeMode::Accept) {
            HandshakeMode::Accept => encode_handshake_reply(&HandshakeReply {
                request_channel: request_name(&request.serial),
                notification_channel: notification_name(&request.serial),
            }),
            HandshakeMode::ErrorReply => 7u32.to_le_bytes().to_vec(),
            HandshakeMode::Mismatch => {
                let mut reply = encode_handshake_reply(&HandshakeReply {
                    request_channel: "r".into(),
                    notification_channel: "n".into(),
                });
                reply[..4].copy_from_slice(b"fals");
                reply
            }
            HandshakeMode::Silent => Vec::new(),
        }
    }
}

impl Channel for FakeChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> ChannelRole {
        self.role
    }

    fn exchange(&self, message: &[u8], want_reply: bool) -> Result<Vec<u8>, TransportError> {
        let id = message_id(message).unwrap_or(0);
        self.state.lock().log.push((self.name.clone(), msg::name(id)));

        if self.name == BOOTSTRAP_PORT_NAME {
            return Ok(self.handshake(message));
        }
        if id == msg::ACKNOWLEDGE_PORT {
            let port = decode_ack_port(message).expect("valid ack");
            let mut state = self.state.lock();
            if state.reject_ack {
                return Ok(0u32.to_le_bytes().to_vec());
            }
            state.acked.push(port);
            return Ok(SUCCESS.to_le_bytes().to_vec());
        }
        Ok(if want_reply {
            SUCCESS.to_le_bytes().to_vec()
        } else {
            Vec::new()
        })
    }

    fn poll_once(&self) -> Result<PollOutcome, TransportError> {
        let next = self
            .state
            .lock()
            .outbox
            .get_mut(&self.name)
            .and_then(|q| q.pop_front());
        match next {
            Some(message) => Ok(PollOutcome::Received(vec![message])),
            None => {
                std::thread::sleep(Duration::from_millis(5));
                Ok(PollOutcome::TimedOut)
            }
        }
    }
}
