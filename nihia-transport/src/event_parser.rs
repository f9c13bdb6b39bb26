//! Notification decoding
//!
//! The daemon pushes notifications on the notification channel. Each one is a
//! 4-byte message id followed by a body whose layout depends on the id. Most
//! notifications carry one event; pad-touch notifications batch several
//! `[pad_number][pad][pressure]` triples.
//!
//! Decoding never fails: truncated bodies and unknown ids become
//! [`NotificationEvent::Unknown`] so the dispatcher keeps going.

use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::protocol::{put_string, put_u32, WireReader};
use crate::types::{DeviceTypeId, NotificationEvent};

/// Notification message ids (daemon → client).
///
/// Separate namespace from the request ids in `protocol::msg`.
pub mod notif {
    pub const DEVICE_STATE: u32 = 0x0344_7300;
    pub const CLIENT: u32 = 0x0343_6C00;
    pub const BUTTON: u32 = 0x0342_7400;
    pub const KNOB: u32 = 0x034B_6E00;
    pub const ENCODER: u32 = 0x0345_6E00;
    pub const TOUCHSTRIP: u32 = 0x0354_7300;
    pub const PAD_TOUCH: u32 = 0x0350_6400;
    pub const CLAIM_CHANGED: u32 = 0x0343_6300;
    pub const ACK: u32 = 0x0341_6B00;

    /// Get human-readable name for a notification id
    pub fn name(id: u32) -> &'static str {
        match id {
            DEVICE_STATE => "DEVICE_STATE",
            CLIENT => "CLIENT",
            BUTTON => "BUTTON",
            KNOB => "KNOB",
            ENCODER => "ENCODER",
            TOUCHSTRIP => "TOUCHSTRIP",
            PAD_TOUCH => "PAD_TOUCH",
            CLAIM_CHANGED => "CLAIM_CHANGED",
            ACK => "ACK",
            _ => "UNKNOWN",
        }
    }
}

/// Sub-types of the CLIENT notification
pub mod client {
    pub const FOCUS: u32 = 1;
    pub const CLAIM_ACQUIRED: u32 = 2;
    pub const OCTAVE_CHANGED: u32 = 3;
}

/// DEVICE_STATE state values
pub mod device_state {
    pub const DETACHED: u32 = 0;
    pub const ATTACHED: u32 = 1;
}

/// Decode one notification into zero or more events.
///
/// Pad-touch batches yield one event per pad; everything else yields one event.
pub fn parse_notification(data: &[u8]) -> Vec<NotificationEvent> {
    let mut r = WireReader::new(data);
    let id = match r.u32() {
        Ok(id) => id,
        Err(_) => {
            warn!("Notification too short ({} bytes): {:02X?}", data.len(), data);
            return vec![NotificationEvent::Unknown { id: 0 }];
        }
    };

    match parse_body(id, &mut r) {
        Ok(events) => events,
        Err(e) => {
            warn!(
                "Malformed {} notification (0x{:08X}): {}",
                notif::name(id),
                id,
                e
            );
            vec![NotificationEvent::Unknown { id }]
        }
    }
}

fn parse_body(id: u32, r: &mut WireReader<'_>) -> Result<Vec<NotificationEvent>, ProtocolError> {
    let event = match id {
        notif::DEVICE_STATE => {
            let state = r.u32()?;
            let device_type = DeviceTypeId(r.u32()?);
            let serial = r.string()?;
            NotificationEvent::DeviceStateChanged {
                device_type,
                serial,
                attached: state == device_state::ATTACHED,
            }
        }

        notif::CLIENT => {
            let subtype = r.u32()?;
            let value = r.u32()?;
            match subtype {
                client::FOCUS => NotificationEvent::ClientFocusChanged,
                client::CLAIM_ACQUIRED => NotificationEvent::ClientClaimAcquired,
                client::OCTAVE_CHANGED => NotificationEvent::ClientOctaveChanged { new_base: value },
                other => {
                    debug!("Unhandled client notification subtype {}", other);
                    NotificationEvent::Unknown { id }
                }
            }
        }

        // [pad][pad][event_subtype][button_id][state]
        notif::BUTTON => {
            r.u32()?;
            r.u32()?;
            let _subtype = r.u32()?;
            let button_id = r.u32()?;
            let state = r.u32()?;
            NotificationEvent::Button {
                id: button_id,
                pressed: state != 0,
            }
        }

        // [pad][pad][pad][knob_index][value]
        notif::KNOB => {
            r.u32()?;
            r.u32()?;
            r.u32()?;
            let index = r.u32()?;
            let value = r.i32()?;
            NotificationEvent::Knob { index, value }
        }

        // [timestamp][value]
        notif::ENCODER => {
            let _timestamp = r.u32()?;
            NotificationEvent::Encoder { value: r.i32()? }
        }

        // Touch strip data arrives over MIDI; the notification is only a marker
        notif::TOUCHSTRIP => NotificationEvent::Touchstrip,

        notif::PAD_TOUCH => return parse_pad_touches(r),

        notif::CLAIM_CHANGED => NotificationEvent::ClaimChanged {
            has_claim: r.u32()? != 0,
        },

        notif::ACK => NotificationEvent::Ack,

        _ => {
            debug!("Unknown notification id 0x{:08X}", id);
            NotificationEvent::Unknown { id }
        }
    };
    Ok(vec![event])
}

/// Repeated `[pad_number][pad][pressure]` until the buffer is exhausted.
///
/// Complete triples are kept when trailing bytes do not form a full triple;
/// only a batch with no complete triple is an error.
fn parse_pad_touches(r: &mut WireReader<'_>) -> Result<Vec<NotificationEvent>, ProtocolError> {
    let mut events = Vec::with_capacity(r.remaining() / 12);
    while r.remaining() >= 12 {
        let pad_number = r.u32()?;
        r.u32()?;
        let pressure = r.u32()?;
        events.push(NotificationEvent::PadTouch {
            pad_number,
            pressure,
        });
    }
    if events.is_empty() {
        return Err(ProtocolError::Truncated {
            needed: 16,
            got: 4 + r.remaining(),
        });
    }
    if r.remaining() > 0 {
        warn!(
            "Pad-touch batch has {} trailing bytes after {} touches",
            r.remaining(),
            events.len()
        );
    }
    Ok(events)
}

/// Encode an event as the daemon would send it.
///
/// Used by fakes and replay tooling; the client itself only decodes.
/// `Unknown` encodes to its bare id.
pub fn encode_notification(event: &NotificationEvent) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    match event {
        NotificationEvent::DeviceStateChanged {
            device_type,
            serial,
            attached,
        } => {
            put_u32(&mut buf, notif::DEVICE_STATE);
            put_u32(
                &mut buf,
                if *attached {
                    device_state::ATTACHED
                } else {
                    device_state::DETACHED
                },
            );
            put_u32(&mut buf, device_type.0);
            put_string(&mut buf, serial);
        }
        NotificationEvent::ClientFocusChanged => {
            put_u32(&mut buf, notif::CLIENT);
            put_u32(&mut buf, client::FOCUS);
            put_u32(&mut buf, 0);
        }
        NotificationEvent::ClientClaimAcquired => {
            put_u32(&mut buf, notif::CLIENT);
            put_u32(&mut buf, client::CLAIM_ACQUIRED);
            put_u32(&mut buf, 0);
        }
        NotificationEvent::ClientOctaveChanged { new_base } => {
            put_u32(&mut buf, notif::CLIENT);
            put_u32(&mut buf, client::OCTAVE_CHANGED);
            put_u32(&mut buf, *new_base);
        }
        NotificationEvent::Button { id, pressed } => {
            put_u32(&mut buf, notif::BUTTON);
            put_u32(&mut buf, 0);
            put_u32(&mut buf, 0);
            put_u32(&mut buf, 0);
            put_u32(&mut buf, *id);
            put_u32(&mut buf, u32::from(*pressed));
        }
        NotificationEvent::Knob { index, value } => {
            put_u32(&mut buf, notif::KNOB);
            put_u32(&mut buf, 0);
            put_u32(&mut buf, 0);
            put_u32(&mut buf, 0);
            put_u32(&mut buf, *index);
            put_u32(&mut buf, *value as u32);
        }
        NotificationEvent::Encoder { value } => {
            put_u32(&mut buf, notif::ENCODER);
            put_u32(&mut buf, 0);
            put_u32(&mut buf, *value as u32);
        }
        NotificationEvent::Touchstrip => put_u32(&mut buf, notif::TOUCHSTRIP),
        NotificationEvent::PadTouch {
            pad_number,
            pressure,
        } => {
            put_u32(&mut buf, notif::PAD_TOUCH);
            put_u32(&mut buf, *pad_number);
            put_u32(&mut buf, 0);
            put_u32(&mut buf, *pressure);
        }
        NotificationEvent::ClaimChanged { has_claim } => {
            put_u32(&mut buf, notif::CLAIM_CHANGED);
            put_u32(&mut buf, u32::from(*has_claim));
        }
        NotificationEvent::Ack => put_u32(&mut buf, notif::ACK),
        NotificationEvent::Unknown { id } => put_u32(&mut buf, *id),
    }
    buf
}

/// Encode a batch of pad touches as a single notification
pub fn encode_pad_touches(touches: &[(u32, u32)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + touches.len() * 12);
    put_u32(&mut buf, notif::PAD_TOUCH);
    for &(pad_number, pressure) in touches {
        put_u32(&mut buf, pad_number);
        put_u32(&mut buf, 0);
        put_u32(&mut buf, pressure);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(event: NotificationEvent) {
        let encoded = encode_notification(&event);
        assert_eq!(parse_notification(&encoded), vec![event]);
    }

    #[test]
    fn test_device_state_roundtrip() {
        roundtrip(NotificationEvent::DeviceStateChanged {
            device_type: DeviceTypeId::KOMPLETE_KONTROL_S49_MK2,
            serial: "AB12CD34".into(),
            attached: true,
        });
        // Empty serial still carries its terminating NUL
        roundtrip(NotificationEvent::DeviceStateChanged {
            device_type: DeviceTypeId::MASCHINE_MK3,
            serial: String::new(),
            attached: false,
        });
    }

    #[test]
    fn test_client_roundtrip() {
        roundtrip(NotificationEvent::ClientFocusChanged);
        roundtrip(NotificationEvent::ClientClaimAcquired);
        roundtrip(NotificationEvent::ClientOctaveChanged { new_base: 0 });
        roundtrip(NotificationEvent::ClientOctaveChanged { new_base: 127 });
    }

    #[test]
    fn test_controls_roundtrip() {
        roundtrip(NotificationEvent::Button {
            id: 42,
            pressed: true,
        });
        roundtrip(NotificationEvent::Button {
            id: 0,
            pressed: false,
        });
        roundtrip(NotificationEvent::Knob {
            index: 7,
            value: -3,
        });
        roundtrip(NotificationEvent::Knob {
            index: 0,
            value: i32::MAX,
        });
        roundtrip(NotificationEvent::Encoder { value: i32::MIN });
        roundtrip(NotificationEvent::Encoder { value: 1 });
    }

    #[test]
    fn test_pad_touch_boundaries() {
        for (pad_number, pressure) in [(0, 0), (7, u32::MAX), (0, u32::MAX), (7, 0)] {
            roundtrip(NotificationEvent::PadTouch {
                pad_number,
                pressure,
            });
        }
    }

    #[test]
    fn test_claim_and_ack_roundtrip() {
        roundtrip(NotificationEvent::ClaimChanged { has_claim: false });
        roundtrip(NotificationEvent::ClaimChanged { has_claim: true });
        roundtrip(NotificationEvent::Ack);
        roundtrip(NotificationEvent::Touchstrip);
    }

    #[test]
    fn test_pad_touch_batch() {
        let buf = encode_pad_touches(&[(0, 512), (3, 0), (15, 4095)]);
        assert_eq!(
            parse_notification(&buf),
            vec![
                NotificationEvent::PadTouch {
                    pad_number: 0,
                    pressure: 512
                },
                NotificationEvent::PadTouch {
                    pad_number: 3,
                    pressure: 0
                },
                NotificationEvent::PadTouch {
                    pad_number: 15,
                    pressure: 4095
                },
            ]
        );
    }

    #[test]
    fn test_pad_touch_partial_triple_keeps_complete_touches() {
        // A release followed by a cut-off triple
        let mut buf = encode_pad_touches(&[(1, 100), (4, 0)]);
        buf.extend_from_slice(&[2, 0, 0, 0]);
        assert_eq!(
            parse_notification(&buf),
            vec![
                NotificationEvent::PadTouch {
                    pad_number: 1,
                    pressure: 100
                },
                NotificationEvent::PadTouch {
                    pad_number: 4,
                    pressure: 0
                },
            ]
        );
    }

    #[test]
    fn test_pad_touch_without_full_triple_is_unknown() {
        let mut buf = encode_pad_touches(&[]);
        assert_eq!(
            parse_notification(&buf),
            vec![NotificationEvent::Unknown {
                id: notif::PAD_TOUCH
            }]
        );
        buf.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            parse_notification(&buf),
            vec![NotificationEvent::Unknown {
                id: notif::PAD_TOUCH
            }]
        );
    }

    #[test]
    fn test_unknown_id() {
        let buf = 0xDEAD_BEEFu32.to_le_bytes();
        assert_eq!(
            parse_notification(&buf),
            vec![NotificationEvent::Unknown { id: 0xDEAD_BEEF }]
        );
    }

    #[test]
    fn test_truncated_bodies_do_not_panic() {
        let full = encode_notification(&NotificationEvent::DeviceStateChanged {
            device_type: DeviceTypeId::MASCHINE_MK3,
            serial: "XYZ".into(),
            attached: true,
        });
        for len in 4..full.len() {
            assert_eq!(
                parse_notification(&full[..len]),
                vec![NotificationEvent::Unknown {
                    id: notif::DEVICE_STATE
                }],
                "len {len}"
            );
        }
        assert_eq!(
            parse_notification(&[0x00, 0x75]),
            vec![NotificationEvent::Unknown { id: 0 }]
        );
    }

    #[test]
    fn test_unknown_client_subtype() {
        let mut buf = Vec::new();
        put_u32(&mut buf, notif::CLIENT);
        put_u32(&mut buf, 99);
        put_u32(&mut buf, 0);
        assert_eq!(
            parse_notification(&buf),
            vec![NotificationEvent::Unknown { id: notif::CLIENT }]
        );
    }
}
