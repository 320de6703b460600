//! Command registry for the board MCU.
//!
//! Every outgoing command is described by a [`CommandSpec`]: the command
//! byte, the response type it elicits (if any), an optional default payload,
//! and whether the frame is *short* (no length/address fields).

/// Response type carried by unsolicited piece-event frames.
pub const PIECE_EVENT_RESP: u8 = 0x8e;

/// Static description of one MCU command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    /// Command byte sent on the wire.
    pub cmd: u8,
    /// Expected response type byte; `None` marks fire-and-forget commands.
    pub expected_resp: Option<u8>,
    /// Payload used when the caller supplies none.
    pub default_payload: Option<&'static [u8]>,
    /// Short commands omit the length/address header.
    pub short: bool,
}

/// The commands the controller uses, by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Request full board state snapshot (`0x82` → `0x85`).
    SendState,
    /// Request piece changes since last call (`0x83` → `0x85`).
    SendChanges,
    /// Query the bus address (`0x46` → `0x90`).
    ReturnBusAddress,
    /// Request the trademark / metadata block (`0x97` → `0xb4`).
    SendTrademark,
    /// Enable key + piece notifications (`0x58` → `0xa3`).
    NotifyEvents,
    /// Battery / charger status (`0x98` → `0xb5`).
    SendBatteryInfo,
    /// Analog sensor snapshot, first stage (`0xf0` → `0xf0`).
    SnapshotF0,
    /// Analog sensor snapshot, second stage (`0xf4` → `0xf4`).
    SnapshotF4,
    /// Power the MCU down (`0xb2` → `0xb1` ack).
    Sleep,
    /// All LEDs dark (`0xb0`, payload `0x00`).
    LedsOff,
    /// LED pattern command (`0xb0`, mode payload supplied by caller).
    LedFlash,
    SoundGeneral,
    SoundFactory,
    SoundPowerOff,
    SoundPowerOn,
    SoundWrong,
    SoundWrongMove,
    /// Early-init poll sent before the address is learned. Short.
    InitPoll,
    /// Early-init handshake. Short.
    InitHandshake,
    /// Post-snapshot init command. Short.
    InitConfirm,
}

impl Command {
    pub const fn spec(self) -> CommandSpec {
        match self {
            Command::SendState => CommandSpec {
                name: "SEND_STATE",
                cmd: 0x82,
                expected_resp: Some(0x85),
                default_payload: None,
                short: false,
            },
            Command::SendChanges => CommandSpec {
                name: "SEND_CHANGES",
                cmd: 0x83,
                expected_resp: Some(0x85),
                default_payload: None,
                short: false,
            },
            Command::ReturnBusAddress => CommandSpec {
                name: "RETURN_BUS_ADDRESS",
                cmd: 0x46,
                expected_resp: Some(0x90),
                default_payload: None,
                short: false,
            },
            Command::SendTrademark => CommandSpec {
                name: "SEND_TRADEMARK",
                cmd: 0x97,
                expected_resp: Some(0xb4),
                default_payload: None,
                short: false,
            },
            Command::NotifyEvents => CommandSpec {
                name: "NOTIFY_EVENTS",
                cmd: 0x58,
                expected_resp: Some(0xa3),
                default_payload: None,
                short: false,
            },
            Command::SendBatteryInfo => CommandSpec {
                name: "SEND_BATTERY_INFO",
                cmd: 0x98,
                expected_resp: Some(0xb5),
                default_payload: None,
                short: false,
            },
            Command::SnapshotF0 => CommandSpec {
                name: "SNAPSHOT_F0",
                cmd: 0xf0,
                expected_resp: Some(0xf0),
                default_payload: Some(&[0x7f]),
                short: false,
            },
            Command::SnapshotF4 => CommandSpec {
                name: "SNAPSHOT_F4",
                cmd: 0xf4,
                expected_resp: Some(0xf4),
                default_payload: Some(&[0x7f]),
                short: false,
            },
            Command::Sleep => CommandSpec {
                name: "SLEEP",
                cmd: 0xb2,
                expected_resp: Some(0xb1),
                default_payload: Some(&[0x0a]),
                short: false,
            },
            Command::LedsOff => CommandSpec {
                name: "LEDS_OFF",
                cmd: 0xb0,
                expected_resp: None,
                default_payload: Some(&[0x00]),
                short: false,
            },
            Command::LedFlash => CommandSpec {
                name: "LED_FLASH",
                cmd: 0xb0,
                expected_resp: None,
                default_payload: Some(&[0x05, 0x0a, 0x00, 0x01]),
                short: false,
            },
            Command::SoundGeneral => CommandSpec {
                name: "SOUND_GENERAL",
                cmd: 0xb1,
                expected_resp: None,
                default_payload: Some(&[0x4c, 0x08]),
                short: false,
            },
            Command::SoundFactory => CommandSpec {
                name: "SOUND_FACTORY",
                cmd: 0xb1,
                expected_resp: None,
                default_payload: Some(&[0x4c, 0x40]),
                short: false,
            },
            Command::SoundPowerOff => CommandSpec {
                name: "SOUND_POWER_OFF",
                cmd: 0xb1,
                expected_resp: None,
                default_payload: Some(&[0x4c, 0x08, 0x48, 0x08]),
                short: false,
            },
            Command::SoundPowerOn => CommandSpec {
                name: "SOUND_POWER_ON",
                cmd: 0xb1,
                expected_resp: None,
                default_payload: Some(&[0x48, 0x08, 0x4c, 0x08]),
                short: false,
            },
            Command::SoundWrong => CommandSpec {
                name: "SOUND_WRONG",
                cmd: 0xb1,
                expected_resp: None,
                default_payload: Some(&[0x4e, 0x0c, 0x48, 0x10]),
                short: false,
            },
            Command::SoundWrongMove => CommandSpec {
                name: "SOUND_WRONG_MOVE",
                cmd: 0xb1,
                expected_resp: None,
                default_payload: Some(&[0x48, 0x08]),
                short: false,
            },
            Command::InitPoll => CommandSpec {
                name: "INIT_POLL",
                cmd: 0x94,
                expected_resp: Some(0xb1),
                default_payload: None,
                short: true,
            },
            Command::InitHandshake => CommandSpec {
                name: "INIT_HANDSHAKE",
                cmd: 0x87,
                expected_resp: Some(0x87),
                default_payload: None,
                short: true,
            },
            Command::InitConfirm => CommandSpec {
                name: "INIT_CONFIRM",
                cmd: 0x96,
                expected_resp: Some(0xb2),
                default_payload: None,
                short: true,
            },
        }
    }

    pub const ALL: [Command; 20] = [
        Command::SendState,
        Command::SendChanges,
        Command::ReturnBusAddress,
        Command::SendTrademark,
        Command::NotifyEvents,
        Command::SendBatteryInfo,
        Command::SnapshotF0,
        Command::SnapshotF4,
        Command::Sleep,
        Command::LedsOff,
        Command::LedFlash,
        Command::SoundGeneral,
        Command::SoundFactory,
        Command::SoundPowerOff,
        Command::SoundPowerOn,
        Command::SoundWrong,
        Command::SoundWrongMove,
        Command::InitPoll,
        Command::InitHandshake,
        Command::InitConfirm,
    ];

    pub fn name(self) -> &'static str {
        self.spec().name
    }
}

/// Type bytes that can legitimately start an inbound frame. Used by the
/// parser's orphan detection.
pub fn start_type_bytes() -> Vec<u8> {
    let mut types: Vec<u8> = Command::ALL
        .iter()
        .filter_map(|c| c.spec().expected_resp)
        .collect();
    // Discovery-era types seen on a cold bus.
    types.push(0x87);
    types.push(0x93);
    types.push(PIECE_EVENT_RESP);
    types.sort_unstable();
    types.dedup();
    types
}

/// Response types for short commands: frames without length/address fields.
pub fn short_response_types() -> Vec<u8> {
    let mut types: Vec<u8> = Command::ALL
        .iter()
        .filter(|c| c.spec().short)
        .filter_map(|c| c.spec().expected_resp)
        .collect();
    types.sort_unstable();
    types.dedup();
    types
}
