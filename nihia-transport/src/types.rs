//! Common types for the transport layer

use std::fmt;
use std::str::FromStr;

/// Hardware model identifier.
///
/// The daemon uses the USB product id of the model as its device type, so the
/// same number shows up in `lsusb`/Device Manager listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceTypeId(pub u32);

impl DeviceTypeId {
    pub const MASCHINE_MK3: Self = Self(0x1600);
    pub const KOMPLETE_KONTROL_S49_MK2: Self = Self(0x1610);
    pub const KOMPLETE_KONTROL_S61_MK2: Self = Self(0x1620);
    pub const KOMPLETE_KONTROL_S88_MK2: Self = Self(0x1630);
    pub const MASCHINE_MIKRO_MK3: Self = Self(0x1700);

    /// All models with a known name and family
    pub const KNOWN: &'static [DeviceTypeId] = &[
        Self::MASCHINE_MK3,
        Self::KOMPLETE_KONTROL_S49_MK2,
        Self::KOMPLETE_KONTROL_S61_MK2,
        Self::KOMPLETE_KONTROL_S88_MK2,
        Self::MASCHINE_MIKRO_MK3,
    ];

    /// Human-readable model name
    pub fn name(&self) -> &'static str {
        match *self {
            Self::MASCHINE_MK3 => "Maschine MK3",
            Self::KOMPLETE_KONTROL_S49_MK2 => "Komplete Kontrol S49 MK2",
            Self::KOMPLETE_KONTROL_S61_MK2 => "Komplete Kontrol S61 MK2",
            Self::KOMPLETE_KONTROL_S88_MK2 => "Komplete Kontrol S88 MK2",
            Self::MASCHINE_MIKRO_MK3 => "Maschine Mikro MK3",
            _ => "Unknown",
        }
    }

    pub fn family(&self) -> DeviceFamily {
        match *self {
            Self::MASCHINE_MK3 | Self::MASCHINE_MIKRO_MK3 => DeviceFamily::Maschine,
            Self::KOMPLETE_KONTROL_S49_MK2
            | Self::KOMPLETE_KONTROL_S61_MK2
            | Self::KOMPLETE_KONTROL_S88_MK2 => DeviceFamily::KompleteKontrol,
            _ => DeviceFamily::Unknown,
        }
    }

    /// Whether the model has the dual 480x272 screens
    pub fn has_displays(&self) -> bool {
        matches!(
            *self,
            Self::MASCHINE_MK3
                | Self::KOMPLETE_KONTROL_S49_MK2
                | Self::KOMPLETE_KONTROL_S61_MK2
                | Self::KOMPLETE_KONTROL_S88_MK2
        )
    }
}

impl fmt::Display for DeviceTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} ({})", self.0, self.name())
    }
}

impl FromStr for DeviceTypeId {
    type Err = String;

    /// Accepts `0x1600`, `5632` or a short model alias (`mk3`, `mikro`, `s49`, `s61`, `s88`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if let Some(hex) = lower.strip_prefix("0x") {
            return u32::from_str_radix(hex, 16)
                .map(DeviceTypeId)
                .map_err(|e| format!("invalid device type \"{s}\": {e}"));
        }
        if let Ok(n) = lower.parse::<u32>() {
            return Ok(DeviceTypeId(n));
        }
        match lower.as_str() {
            "mk3" | "maschine" | "maschine-mk3" => Ok(Self::MASCHINE_MK3),
            "mikro" | "mikro-mk3" => Ok(Self::MASCHINE_MIKRO_MK3),
            "s49" | "s49mk2" => Ok(Self::KOMPLETE_KONTROL_S49_MK2),
            "s61" | "s61mk2" => Ok(Self::KOMPLETE_KONTROL_S61_MK2),
            "s88" | "s88mk2" => Ok(Self::KOMPLETE_KONTROL_S88_MK2),
            _ => Err(format!(
                "unknown device type \"{s}\". Use a product id (0x1600) or mk3/mikro/s49/s61/s88"
            )),
        }
    }
}

/// Product family, used to pick the client identity presented to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    Maschine,
    KompleteKontrol,
    Unknown,
}

/// Which vendor client application this process claims to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftwareIdentity(pub u32);

impl SoftwareIdentity {
    pub const MASCHINE: Self = Self(u32::from_le_bytes(*b"NiMS"));
    pub const KOMPLETE_KONTROL: Self = Self(u32::from_le_bytes(*b"NiKK"));

    /// Identity the daemon expects for a given model
    pub fn for_device(device_type: DeviceTypeId) -> Self {
        match device_type.family() {
            DeviceFamily::Maschine => Self::MASCHINE,
            DeviceFamily::KompleteKontrol | DeviceFamily::Unknown => Self::KOMPLETE_KONTROL,
        }
    }
}

/// Role a channel is opened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Client end of a daemon-owned channel, used for requests
    Remote,
    /// Locally created, daemon-addressable channel that receives notifications
    Local,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Remote => "request",
            ChannelRole::Local => "notification",
        }
    }
}

/// Result of one bounded notification poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The slice handled activity. May carry zero messages when the activity
    /// was bookkeeping (a peer connecting, a partial read).
    Received(Vec<Vec<u8>>),
    /// Nothing happened within the poll timeout
    TimedOut,
}

/// One key range lit in a single color on keyboards with light guides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyZone {
    pub first_key: u32,
    pub last_key: u32,
    pub color: u32,
}

impl FromStr for KeyZone {
    type Err = String;

    /// Parse `first:last:color`, e.g. `36:47:12`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(format!("invalid key zone \"{s}\". Use first:last:color"));
        }
        let parse = |p: &str| {
            p.trim()
                .parse::<u32>()
                .map_err(|e| format!("invalid key zone \"{s}\": {e}"))
        };
        let zone = KeyZone {
            first_key: parse(parts[0])?,
            last_key: parse(parts[1])?,
            color: parse(parts[2])?,
        };
        if zone.first_key > zone.last_key {
            return Err(format!("invalid key zone \"{s}\": first key after last key"));
        }
        Ok(zone)
    }
}

/// Decoded hardware notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    /// A unit of `device_type` was plugged in or removed
    DeviceStateChanged {
        device_type: DeviceTypeId,
        serial: String,
        attached: bool,
    },
    /// Another client application took or gave back focus
    ClientFocusChanged,
    /// The daemon granted this client control of the device
    ClientClaimAcquired,
    /// Octave buttons moved the keyboard's base note
    ClientOctaveChanged { new_base: u32 },
    Button { id: u32, pressed: bool },
    Knob { index: u32, value: i32 },
    /// Main 4D encoder turn
    Encoder { value: i32 },
    /// Touch strip activity; its data arrives over MIDI instead
    Touchstrip,
    /// Pressure of 0 means the pad was released
    PadTouch { pad_number: u32, pressure: u32 },
    ClaimChanged { has_claim: bool },
    Ack,
    /// Unknown or malformed notification
    Unknown { id: u32 },
}

impl NotificationEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::DeviceStateChanged { .. } => "device-state",
            NotificationEvent::ClientFocusChanged => "focus",
            NotificationEvent::ClientClaimAcquired => "claim-acquired",
            NotificationEvent::ClientOctaveChanged { .. } => "octave",
            NotificationEvent::Button { .. } => "button",
            NotificationEvent::Knob { .. } => "knob",
            NotificationEvent::Encoder { .. } => "encoder",
            NotificationEvent::Touchstrip => "touchstrip",
            NotificationEvent::PadTouch { .. } => "pad-touch",
            NotificationEvent::ClaimChanged { .. } => "claim-changed",
            NotificationEvent::Ack => "ack",
            NotificationEvent::Unknown { .. } => "unknown",
        }
    }
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationEvent::DeviceStateChanged {
                device_type,
                serial,
                attached,
            } => write!(
                f,
                "{} {} serial={:?}",
                device_type,
                if *attached { "attached" } else { "detached" },
                serial
            ),
            NotificationEvent::ClientOctaveChanged { new_base } => {
                write!(f, "octave base={new_base}")
            }
            NotificationEvent::Button { id, pressed } => write!(
                f,
                "button {} {}",
                id,
                if *pressed { "down" } else { "up" }
            ),
            NotificationEvent::Knob { index, value } => write!(f, "knob {index} {value:+}"),
            NotificationEvent::Encoder { value } => write!(f, "encoder {value:+}"),
            NotificationEvent::PadTouch {
                pad_number,
                pressure,
            } => write!(f, "pad {pad_number} pressure={pressure}"),
            NotificationEvent::ClaimChanged { has_claim } => {
                write!(f, "claim {}", if *has_claim { "held" } else { "lost" })
            }
            NotificationEvent::Unknown { id } => write!(f, "unknown 0x{id:08X}"),
            other => f.write_str(other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_parse() {
        assert_eq!("0x1600".parse::<DeviceTypeId>().unwrap(), DeviceTypeId::MASCHINE_MK3);
        assert_eq!("5648".parse::<DeviceTypeId>().unwrap(), DeviceTypeId(0x1610));
        assert_eq!(
            "S88".parse::<DeviceTypeId>().unwrap(),
            DeviceTypeId::KOMPLETE_KONTROL_S88_MK2
        );
        assert!("banjo".parse::<DeviceTypeId>().is_err());
    }

    #[test]
    fn test_software_identity_by_family() {
        assert_eq!(
            SoftwareIdentity::for_device(DeviceTypeId::MASCHINE_MIKRO_MK3),
            SoftwareIdentity::MASCHINE
        );
        assert_eq!(
            SoftwareIdentity::for_device(DeviceTypeId::KOMPLETE_KONTROL_S61_MK2),
            SoftwareIdentity::KOMPLETE_KONTROL
        );
        assert_eq!(
            SoftwareIdentity::for_device(DeviceTypeId(0xBEEF)),
            SoftwareIdentity::KOMPLETE_KONTROL
        );
    }

    #[test]
    fn test_key_zone_parse() {
        let zone: KeyZone = "36:47:12".parse().unwrap();
        assert_eq!(
            zone,
            KeyZone {
                first_key: 36,
                last_key: 47,
                color: 12
            }
        );
        assert!("47:36:1".parse::<KeyZone>().is_err());
        assert!("1:2".parse::<KeyZone>().is_err());
    }
}
