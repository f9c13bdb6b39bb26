//! Notification dispatch loop
//!
//! One thread per connection polls the notification channel, decodes what
//! arrives and hands events to the connection's [`EventSink`]. When the
//! channel stays silent for `stall_threshold` consecutive polls the daemon has
//! most likely forgotten us, so the subscription request is sent again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nihia_transport::protocol::{encode_simple, msg};
use nihia_transport::{parse_notification, Channel, NotificationEvent, PollOutcome};
use tracing::{debug, info, trace, warn};

use crate::connection::RequestPath;
use crate::handler::EventSink;
use crate::registry::DeviceRegistry;

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Used for the thread name and log lines
    pub label: String,
    /// Consecutive empty polls before re-subscribing
    pub stall_threshold: u32,
    /// Sleep after a failed poll
    pub error_backoff: Duration,
    /// Push sent to re-subscribe, if any
    pub resubscribe: Option<u32>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    notifications: Arc<dyn Channel>,
    requests: Arc<RequestPath>,
    registry: Arc<DeviceRegistry>,
    sink: EventSink,
    shutdown: Arc<AtomicBool>,
    resubscribes: u64,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        notifications: Arc<dyn Channel>,
        requests: Arc<RequestPath>,
        registry: Arc<DeviceRegistry>,
        sink: EventSink,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            notifications,
            requests,
            registry,
            sink,
            shutdown,
            resubscribes: 0,
        }
    }

    /// Run on a dedicated named thread
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("nihia-dispatch-{}", self.config.label))
            .spawn(move || {
                self.run();
            })
    }

    /// Poll until the shutdown flag is set. Returns the number of re-subscribes issued.
    pub fn run(mut self) -> u64 {
        debug!(
            "{} dispatcher started (sink: {})",
            self.config.label,
            self.sink.kind()
        );
        let threshold = self.config.stall_threshold.max(1);
        let mut consecutive_timeouts = 0u32;

        while !self.shutdown.load(Ordering::Relaxed) {
            if consecutive_timeouts >= threshold {
                info!(
                    "{}: no notifications for {} polls, re-subscribing",
                    self.config.label, consecutive_timeouts
                );
                self.resubscribe();
                consecutive_timeouts = 0;
            }

            match self.notifications.poll_once() {
                Ok(PollOutcome::TimedOut) => consecutive_timeouts += 1,
                Ok(PollOutcome::Received(messages)) => {
                    consecutive_timeouts = 0;
                    for message in messages {
                        for event in parse_notification(&message) {
                            self.handle(event);
                        }
                    }
                }
                Err(e) => {
                    warn!("{}: notification poll failed: {}", self.config.label, e);
                    consecutive_timeouts += 1;
                    std::thread::sleep(self.config.error_backoff);
                }
            }
        }

        debug!("{} dispatcher exiting", self.config.label);
        self.resubscribes
    }

    fn handle(&mut self, event: NotificationEvent) {
        trace!("{}: {}", self.config.label, event);
        match &event {
            NotificationEvent::DeviceStateChanged {
                device_type,
                serial,
                attached: true,
            } => self.registry.mark_attached(*device_type, serial),
            NotificationEvent::DeviceStateChanged {
                device_type,
                serial,
                attached: false,
            } => self.registry.mark_detached(*device_type, serial),
            NotificationEvent::ClaimChanged { has_claim: false } => {
                info!("{}: control claim lost, re-subscribing", self.config.label);
                self.resubscribe();
            }
            _ => {}
        }
        self.sink.deliver(event);
    }

    fn resubscribe(&mut self) {
        let Some(id) = self.config.resubscribe else {
            return;
        };
        self.resubscribes += 1;
        if let Err(e) = self.requests.push(&encode_simple(id)) {
            warn!(
                "{}: {} push failed: {}",
                self.config.label,
                msg::name(id),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::event_queue;
    use nihia_transport::protocol::message_id;
    use nihia_transport::{encode_notification, ChannelRole, DeviceTypeId, TransportError};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Notification channel that replays a script, then stops the dispatcher
    struct ScriptedPoll {
        script: Mutex<VecDeque<Result<PollOutcome, TransportError>>>,
        shutdown: Arc<AtomicBool>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Channel for ScriptedPoll {
        fn name(&self) -> &str {
            "notif"
        }
        fn role(&self) -> ChannelRole {
            ChannelRole::Local
        }
        fn exchange(&self, _m: &[u8], _w: bool) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::WrongRole("notification"))
        }
        fn poll_once(&self) -> Result<PollOutcome, TransportError> {
            let mut script = self.script.lock();
            let next = script.pop_front();
            if script.is_empty() {
                self.shutdown.store(true, Ordering::Relaxed);
            }
            self.log.lock().push("poll".into());
            next.unwrap_or(Ok(PollOutcome::TimedOut))
        }
    }

    /// Request channel that records pushed message ids in the shared log
    struct RecordingRequests {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Channel for RecordingRequests {
        fn name(&self) -> &str {
            "req"
        }
        fn role(&self) -> ChannelRole {
            ChannelRole::Remote
        }
        fn exchange(&self, m: &[u8], _w: bool) -> Result<Vec<u8>, TransportError> {
            let id = message_id(m).unwrap_or(0);
            self.log.lock().push(msg::name(id).to_string());
            Ok(Vec::new())
        }
        fn poll_once(&self) -> Result<PollOutcome, TransportError> {
            Err(TransportError::WrongRole("request"))
        }
    }

    fn dispatcher(
        script: Vec<PollOutcome>,
        resubscribe: Option<u32>,
        sink: EventSink,
        registry: Arc<DeviceRegistry>,
    ) -> (Dispatcher, Arc<Mutex<Vec<String>>>) {
        let script = script.into_iter().map(Ok).collect();
        scripted_dispatcher(script, resubscribe, sink, registry)
    }

    fn scripted_dispatcher(
        script: Vec<Result<PollOutcome, TransportError>>,
        resubscribe: Option<u32>,
        sink: EventSink,
        registry: Arc<DeviceRegistry>,
    ) -> (Dispatcher, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let notifications = Arc::new(ScriptedPoll {
            script: Mutex::new(script.into()),
            shutdown: shutdown.clone(),
            log: log.clone(),
        });
        let requests = Arc::new(RequestPath::new(Box::new(RecordingRequests {
            log: log.clone(),
        })));
        let config = DispatcherConfig {
            label: "test".into(),
            stall_threshold: 2,
            error_backoff: Duration::ZERO,
            resubscribe,
        };
        (
            Dispatcher::new(config, notifications, requests, registry, sink, shutdown),
            log,
        )
    }

    #[test]
    fn test_stall_recovery() {
        let button = encode_notification(&NotificationEvent::Button {
            id: 9,
            pressed: true,
        });
        let (sink, mut queue) = event_queue(8);
        let (d, log) = dispatcher(
            vec![
                PollOutcome::TimedOut,
                PollOutcome::TimedOut,
                PollOutcome::TimedOut,
                PollOutcome::Received(vec![button]),
            ],
            Some(msg::ACQUIRE_CONTROL),
            sink,
            Arc::new(DeviceRegistry::new()),
        );

        assert_eq!(d.run(), 1);
        assert_eq!(
            *log.lock(),
            vec!["poll", "poll", "ACQUIRE_CONTROL", "poll", "poll"]
        );
        assert_eq!(
            queue.try_recv(),
            Some(NotificationEvent::Button {
                id: 9,
                pressed: true
            })
        );
    }

    #[test]
    fn test_claim_lost_resubscribes() {
        let lost = encode_notification(&NotificationEvent::ClaimChanged { has_claim: false });
        let (d, log) = dispatcher(
            vec![PollOutcome::Received(vec![lost])],
            Some(msg::ACQUIRE_CONTROL),
            EventSink::Discard,
            Arc::new(DeviceRegistry::new()),
        );
        assert_eq!(d.run(), 1);
        assert_eq!(*log.lock(), vec!["poll", "ACQUIRE_CONTROL"]);
    }

    #[test]
    fn test_device_state_updates_registry_in_order() {
        let registry = Arc::new(DeviceRegistry::new());
        let state = |serial: &str, attached| {
            encode_notification(&NotificationEvent::DeviceStateChanged {
                device_type: DeviceTypeId::MASCHINE_MK3,
                serial: serial.into(),
                attached,
            })
        };
        let (sink, mut queue) = event_queue(8);
        let (d, _) = dispatcher(
            vec![PollOutcome::Received(vec![
                state("A", true),
                state("B", true),
                state("A", false),
            ])],
            Some(msg::REQUEST_DEVICE_STATE),
            sink,
            registry.clone(),
        );
        d.run();

        assert_eq!(
            registry.unique_serial(DeviceTypeId::MASCHINE_MK3).as_deref(),
            Some("B")
        );
        let kinds: Vec<_> = std::iter::from_fn(|| queue.try_recv())
            .map(|e| e.to_string())
            .collect();
        assert_eq!(kinds.len(), 3);
        assert!(kinds[2].contains("detached"));
    }

    #[test]
    fn test_no_resubscribe_push_without_message() {
        let (d, log) = dispatcher(
            vec![PollOutcome::TimedOut; 5],
            None,
            EventSink::Discard,
            Arc::new(DeviceRegistry::new()),
        );
        assert_eq!(d.run(), 0);
        assert!(log.lock().iter().all(|entry| entry == "poll"));
    }

    #[test]
    fn test_bad_notification_does_not_stop_dispatch() {
        let (sink, mut queue) = event_queue(8);
        let (d, _) = dispatcher(
            vec![PollOutcome::Received(vec![
                vec![0x01],
                encode_notification(&NotificationEvent::Encoder { value: -2 }),
            ])],
            None,
            sink,
            Arc::new(DeviceRegistry::new()),
        );
        d.run();
        assert_eq!(queue.try_recv(), Some(NotificationEvent::Unknown { id: 0 }));
        assert_eq!(
            queue.try_recv(),
            Some(NotificationEvent::Encoder { value: -2 })
        );
    }

    #[test]
    fn test_poll_errors_count_as_timeouts() {
        let button = encode_notification(&NotificationEvent::Button {
            id: 3,
            pressed: false,
        });
        let (sink, mut queue) = event_queue(8);
        let (d, log) = scripted_dispatcher(
            vec![
                Err(TransportError::Timeout),
                Err(TransportError::Disconnected),
                Ok(PollOutcome::Received(vec![button])),
            ],
            Some(msg::ACQUIRE_CONTROL),
            sink,
            Arc::new(DeviceRegistry::new()),
        );

        assert_eq!(d.run(), 1);
        assert_eq!(*log.lock(), vec!["poll", "poll", "ACQUIRE_CONTROL", "poll"]);
        assert_eq!(
            queue.try_recv(),
            Some(NotificationEvent::Button {
                id: 3,
                pressed: false
            })
        );
    }
}
