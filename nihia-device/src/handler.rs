//! Event delivery from the dispatcher thread to the host

use std::sync::Arc;

use nihia_transport::{DeviceTypeId, NotificationEvent};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Host-side consumer of hardware events.
///
/// Every method has an empty default so handlers only implement what they use.
pub trait EventHandler {
    fn on_button(&mut self, _id: u32, _pressed: bool) {}
    fn on_knob(&mut self, _index: u32, _value: i32) {}
    fn on_encoder(&mut self, _value: i32) {}
    fn on_octave_changed(&mut self, _new_base: u32) {}
    /// Pressure 0 means released
    fn on_pad_touch(&mut self, _pad_number: u32, _pressure: u32) {}
    fn on_focus_changed(&mut self) {}
    fn on_claim_acquired(&mut self) {}
    fn on_claim_changed(&mut self, _has_claim: bool) {}
    fn on_device_state(&mut self, _device_type: DeviceTypeId, _serial: &str, _attached: bool) {}
}

/// Route one event to the matching handler method.
///
/// Touchstrip, ack and unknown events have no handler method.
pub fn dispatch_event(handler: &mut dyn EventHandler, event: &NotificationEvent) {
    match event {
        NotificationEvent::DeviceStateChanged {
            device_type,
            serial,
            attached,
        } => handler.on_device_state(*device_type, serial, *attached),
        NotificationEvent::ClientFocusChanged => handler.on_focus_changed(),
        NotificationEvent::ClientClaimAcquired => handler.on_claim_acquired(),
        NotificationEvent::ClientOctaveChanged { new_base } => handler.on_octave_changed(*new_base),
        NotificationEvent::Button { id, pressed } => handler.on_button(*id, *pressed),
        NotificationEvent::Knob { index, value } => handler.on_knob(*index, *value),
        NotificationEvent::Encoder { value } => handler.on_encoder(*value),
        NotificationEvent::PadTouch {
            pad_number,
            pressure,
        } => handler.on_pad_touch(*pad_number, *pressure),
        NotificationEvent::ClaimChanged { has_claim } => handler.on_claim_changed(*has_claim),
        NotificationEvent::Touchstrip | NotificationEvent::Ack | NotificationEvent::Unknown { .. } => {
            trace!("No handler for {}", event.kind());
        }
    }
}

/// Runs closures in the host's own execution context (UI thread, audio-safe
/// queue, ...)
pub trait HostScheduler: Send + Sync {
    fn schedule(&self, task: Box<dyn FnOnce() + Send>);
}

/// Where the dispatcher sends decoded events
pub enum EventSink {
    /// Bounded queue drained by the host. Events are dropped when it is full.
    Queue(mpsc::Sender<NotificationEvent>),
    /// Call the handler on the dispatcher thread
    Direct(Box<dyn EventHandler + Send>),
    /// Hand each event to the host scheduler, which calls the handler later
    Scheduled {
        scheduler: Arc<dyn HostScheduler>,
        handler: Arc<Mutex<dyn EventHandler + Send>>,
    },
    /// Drop everything (global connections opened only for bookkeeping)
    Discard,
}

impl EventSink {
    pub fn deliver(&mut self, event: NotificationEvent) {
        match self {
            EventSink::Queue(tx) => match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    warn!("Event queue full, dropping {}", event);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!("Event queue closed");
                }
            },
            EventSink::Direct(handler) => dispatch_event(handler.as_mut(), &event),
            EventSink::Scheduled { scheduler, handler } => {
                let handler = handler.clone();
                scheduler.schedule(Box::new(move || {
                    dispatch_event(&mut *handler.lock(), &event);
                }));
            }
            EventSink::Discard => {}
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventSink::Queue(_) => "queue",
            EventSink::Direct(_) => "direct",
            EventSink::Scheduled { .. } => "scheduled",
            EventSink::Discard => "discard",
        }
    }
}

/// Host end of a [`EventSink::Queue`]
pub struct EventQueue {
    rx: mpsc::Receiver<NotificationEvent>,
}

/// Create a bounded queue sink and its receiving end
pub fn event_queue(capacity: usize) -> (EventSink, EventQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink::Queue(tx), EventQueue { rx })
}

impl EventQueue {
    /// Next event; `None` once every connection feeding the queue is gone
    pub async fn recv(&mut self) -> Option<NotificationEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<NotificationEvent> {
        self.rx.try_recv().ok()
    }

    /// Blocking receive for non-async hosts. Panics inside a tokio runtime.
    pub fn blocking_recv(&mut self) -> Option<NotificationEvent> {
        self.rx.blocking_recv()
    }

    /// Deliver everything currently queued; returns how many events were handled
    pub fn drain_into(&mut self, handler: &mut dyn EventHandler) -> usize {
        let mut count = 0;
        while let Ok(event) = self.rx.try_recv() {
            dispatch_event(handler, &event);
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl EventHandler for Recorder {
        fn on_button(&mut self, id: u32, pressed: bool) {
            self.calls.push(format!("button {id} {pressed}"));
        }
        fn on_knob(&mut self, index: u32, value: i32) {
            self.calls.push(format!("knob {index} {value}"));
        }
        fn on_pad_touch(&mut self, pad_number: u32, pressure: u32) {
            self.calls.push(format!("pad {pad_number} {pressure}"));
        }
        fn on_device_state(&mut self, device_type: DeviceTypeId, serial: &str, attached: bool) {
            self.calls
                .push(format!("state {:04X} {serial} {attached}", device_type.0));
        }
    }

    #[test]
    fn test_dispatch_routes_by_kind() {
        let mut rec = Recorder::default();
        dispatch_event(&mut rec, &NotificationEvent::Button { id: 5, pressed: true });
        dispatch_event(&mut rec, &NotificationEvent::Knob { index: 2, value: -1 });
        dispatch_event(&mut rec, &NotificationEvent::Ack);
        dispatch_event(&mut rec, &NotificationEvent::Encoder { value: 3 });
        dispatch_event(
            &mut rec,
            &NotificationEvent::DeviceStateChanged {
                device_type: DeviceTypeId::MASCHINE_MK3,
                serial: "X1".into(),
                attached: false,
            },
        );
        assert_eq!(
            rec.calls,
            vec!["button 5 true", "knob 2 -1", "state 1600 X1 false"]
        );
    }

    #[test]
    fn test_queue_drops_when_full() {
        let (mut sink, mut queue) = event_queue(2);
        for pad in 0..4 {
            sink.deliver(NotificationEvent::PadTouch {
                pad_number: pad,
                pressure: 1,
            });
        }
        let mut rec = Recorder::default();
        assert_eq!(queue.drain_into(&mut rec), 2);
        assert_eq!(rec.calls, vec!["pad 0 1", "pad 1 1"]);
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn test_direct_sink() {
        struct Shared(Arc<Mutex<Vec<u32>>>);
        impl EventHandler for Shared {
            fn on_octave_changed(&mut self, new_base: u32) {
                self.0.lock().push(new_base);
            }
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sink = EventSink::Direct(Box::new(Shared(seen.clone())));
        sink.deliver(NotificationEvent::ClientOctaveChanged { new_base: 48 });
        assert_eq!(*seen.lock(), vec![48]);
    }

    #[test]
    fn test_scheduled_sink_defers() {
        struct Deferred(Mutex<Vec<Box<dyn FnOnce() + Send>>>);
        impl HostScheduler for Deferred {
            fn schedule(&self, task: Box<dyn FnOnce() + Send>) {
                self.0.lock().push(task);
            }
        }
        let scheduler = Arc::new(Deferred(Mutex::new(Vec::new())));
        let handler = Arc::new(Mutex::new(Recorder::default()));
        let mut sink = EventSink::Scheduled {
            scheduler: scheduler.clone(),
            handler: handler.clone(),
        };
        sink.deliver(NotificationEvent::Button { id: 1, pressed: false });
        assert!(handler.lock().calls.is_empty());

        for task in scheduler.0.lock().drain(..) {
            task();
        }
        assert_eq!(handler.lock().calls, vec!["button 1 false"]);
    }
}
