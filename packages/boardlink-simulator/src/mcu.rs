//! Fake MCU state machine.
//!
//! Holds the sensor matrix and answers controller commands byte-for-byte
//! the way the real board does: discovery doubles the address frame, piece
//! events ring the `0x8e` doorbell and are collected by a changes request,
//! key presses ride `0xa3` report frames whose trailing byte is report data
//! rather than a frame checksum.

use rand::Rng;

use boardlink_types::{build_packet, checksum, encode_elapsed, hardware_square, Key};

/// Commands that carry a `<len_hi> <len_lo>` header on the wire.
const PAYLOAD_COMMANDS: [u8; 5] = [0xb0, 0xb1, 0xb2, 0xf0, 0xf4];

/// Commands sent as `[cmd, addr1, addr2, checksum]`.
const BARE_COMMANDS: [u8; 9] = [0x82, 0x83, 0x46, 0x97, 0x58, 0x98, 0x94, 0x87, 0x96];

#[derive(Debug, Clone)]
pub struct McuConfig {
    pub addr1: u8,
    pub addr2: u8,
    pub battery_level: u8,
    pub charging: bool,
    pub serial_no: String,
    pub software_version: String,
    pub hardware_version: String,
    pub build: String,
    pub occupied_level: u16,
    pub empty_level: u16,
    pub sensor_jitter: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flip {
    Lift,
    Place,
}

/// A queued piece event in chess indexing.
#[derive(Debug, Clone, Copy)]
struct QueuedFlip {
    flip: Flip,
    square: u8,
    elapsed: f64,
}

/// What the parser decoded from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McuCommand {
    RequestState,
    RequestChanges,
    RequestAddress,
    Trademark,
    NotifyEnable,
    Battery,
    PollKeys,
    Handshake87,
    Confirm96,
    Snapshot { cmd: u8, payload: Vec<u8> },
    Led(Vec<u8>),
    Sound(Vec<u8>),
    Sleep,
}

pub struct FakeMcu {
    pub config: McuConfig,
    /// Occupancy in chess indexing; 1 = piece on the square.
    pub occupancy: [u8; 64],
    rx: Vec<u8>,
    pending_flips: Vec<QueuedFlip>,
    pub last_led_payload: Option<Vec<u8>>,
    pub sleep_acknowledged: bool,
    pub notifications_enabled: bool,
    /// Every decoded command, in arrival order.
    pub history: Vec<McuCommand>,
}

impl FakeMcu {
    pub fn new(config: McuConfig) -> FakeMcu {
        let mut occupancy = [0u8; 64];
        for (i, slot) in occupancy.iter_mut().enumerate() {
            let rank = i / 8;
            if rank <= 1 || rank >= 6 {
                *slot = 1;
            }
        }
        FakeMcu {
            config,
            occupancy,
            rx: Vec::new(),
            pending_flips: Vec::new(),
            last_led_payload: None,
            sleep_acknowledged: false,
            notifications_enabled: false,
            history: Vec::new(),
        }
    }

    // ── Inbound parsing ───────────────────────────────────────────────────

    /// Feed controller bytes; returns the wire bytes to send back.
    pub fn receive(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut reply = Vec::new();
        for &b in bytes {
            self.rx.push(b);
            while let Some(command) = self.try_decode() {
                reply.extend(self.execute(command));
            }
        }
        reply
    }

    fn try_decode(&mut self) -> Option<McuCommand> {
        if self.rx.is_empty() {
            return None;
        }
        let cmd = self.rx[0];
        if BARE_COMMANDS.contains(&cmd) {
            if self.rx.len() < 4 {
                return None;
            }
            let frame: Vec<u8> = self.rx.drain(..4).collect();
            if frame[3] != checksum(&frame[..3]) {
                return None;
            }
            return Some(match cmd {
                0x82 => McuCommand::RequestState,
                0x83 => McuCommand::RequestChanges,
                0x46 => McuCommand::RequestAddress,
                0x97 => McuCommand::Trademark,
                0x58 => McuCommand::NotifyEnable,
                0x98 => McuCommand::Battery,
                0x94 => McuCommand::PollKeys,
                0x87 => McuCommand::Handshake87,
                _ => McuCommand::Confirm96,
            });
        }
        if PAYLOAD_COMMANDS.contains(&cmd) {
            if self.rx.len() < 3 {
                return None;
            }
            let declared = ((usize::from(self.rx[1] & 0x7f)) << 7) | usize::from(self.rx[2] & 0x7f);
            if declared < 6 || self.rx.len() < declared {
                return None;
            }
            let frame: Vec<u8> = self.rx.drain(..declared).collect();
            if frame[declared - 1] != checksum(&frame[..declared - 1]) {
                return None;
            }
            let payload = frame[5..declared - 1].to_vec();
            return Some(match cmd {
                0xb0 => McuCommand::Led(payload),
                0xb1 => McuCommand::Sound(payload),
                0xb2 => McuCommand::Sleep,
                other => McuCommand::Snapshot {
                    cmd: other,
                    payload,
                },
            });
        }
        // Unknown leading byte: resynchronize.
        self.rx.remove(0);
        None
    }

    // ── Command execution ─────────────────────────────────────────────────

    fn execute(&mut self, command: McuCommand) -> Vec<u8> {
        let (a1, a2) = (self.config.addr1, self.config.addr2);
        self.history.push(command.clone());
        match command {
            McuCommand::RequestAddress => {
                // The real board answers the zero-address query twice.
                let frame = build_packet(0x90, a1, a2, Some(&[]));
                let mut doubled = frame.clone();
                doubled.extend_from_slice(&frame);
                doubled
            }
            McuCommand::NotifyEnable => {
                self.notifications_enabled = true;
                Vec::new()
            }
            McuCommand::RequestChanges => {
                let payload = self.drain_flips_payload();
                build_packet(0x85, a1, a2, Some(&payload))
            }
            McuCommand::RequestState => build_packet(0x85, a1, a2, Some(&self.presence_payload())),
            McuCommand::Snapshot { .. } => self.snapshot_reply(),
            McuCommand::Trademark => {
                let text = format!(
                    "Digital Game Technology\r\nCopyright (c) 2021 DGT\r\n\
                     software version: {}, build: {}\r\n\
                     hardware version: {}, serial no: {}",
                    self.config.software_version,
                    self.config.build,
                    self.config.hardware_version,
                    self.config.serial_no,
                );
                build_packet(0xb4, a1, a2, Some(text.as_bytes()))
            }
            McuCommand::Battery => {
                let mut status = self.config.battery_level & 0x1f;
                if self.config.charging {
                    status |= 1 << 5;
                }
                build_packet(0xb5, a1, a2, Some(&[status]))
            }
            McuCommand::Sound(payload) => {
                tracing::debug!("MCU: sound {payload:02x?}");
                Vec::new()
            }
            McuCommand::Led(payload) => {
                tracing::debug!("MCU: led {payload:02x?}");
                self.last_led_payload = Some(payload);
                Vec::new()
            }
            McuCommand::Sleep => {
                tracing::info!("MCU: sleep acknowledged");
                self.sleep_acknowledged = true;
                // Ack rides a short 0xb1 frame.
                let body = [0xb1, 0x00];
                let mut frame = body.to_vec();
                frame.push(checksum(&body));
                frame
            }
            McuCommand::PollKeys | McuCommand::Handshake87 | McuCommand::Confirm96 => Vec::new(),
        }
    }

    // ── Event generation ──────────────────────────────────────────────────

    /// Apply a physical flip: update the matrix, queue the event, and
    /// return the unsolicited doorbell frame (when notifications are on).
    pub fn flip(&mut self, flip: Flip, square: u8, elapsed: f64) -> Vec<u8> {
        self.occupancy[usize::from(square & 63)] = match flip {
            Flip::Lift => 0,
            Flip::Place => 1,
        };
        self.pending_flips.push(QueuedFlip {
            flip,
            square: square & 63,
            elapsed,
        });
        if self.notifications_enabled {
            build_packet(0x8e, self.config.addr1, self.config.addr2, Some(&[]))
        } else {
            Vec::new()
        }
    }

    /// Key events ride an `0xa3` frame whose last byte is report data; the
    /// trailer is forced off the checksum value so the controller treats it
    /// as a key report.
    pub fn key_frames(&self, key: Key, down_then_up: bool) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(self.key_frame(key, true));
        if down_then_up {
            out.extend(self.key_frame(key, false));
        }
        out
    }

    pub fn key_frame(&self, key: Key, down: bool) -> Vec<u8> {
        let code = key.code();
        let payload: [u8; 6] = if down {
            [0x00, 0x14, 0x0a, 0x05, code, 0x00]
        } else {
            [0x00, 0x14, 0x0a, 0x05, 0x00, code]
        };
        let total = payload.len() + 6;
        let mut frame = vec![
            0xa3,
            ((total >> 7) & 0x7f) as u8,
            (total & 0x7f) as u8,
            self.config.addr1,
            self.config.addr2,
        ];
        frame.extend_from_slice(&payload);
        let cs = checksum(&frame);
        // Trailer deliberately differs from the frame checksum.
        frame.push((cs + 1) & 0x7f);
        frame
    }

    fn drain_flips_payload(&mut self) -> Vec<u8> {
        if self.pending_flips.is_empty() {
            return Vec::new();
        }
        let mut payload = encode_elapsed(self.pending_flips[0].elapsed);
        for flip in self.pending_flips.drain(..) {
            payload.push(match flip.flip {
                Flip::Lift => 0x40,
                Flip::Place => 0x41,
            });
            payload.push(hardware_square(flip.square));
        }
        payload
    }

    fn presence_payload(&self) -> Vec<u8> {
        (0..64u8)
            .map(|hw| self.occupancy[usize::from(boardlink_types::chess_square(hw))])
            .collect()
    }

    /// Analog snapshot reply: 6 header bytes then 64 big-endian words.
    fn snapshot_reply(&self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let mut reply = vec![
            0xf0,
            0x01,
            0x06,
            self.config.addr1,
            self.config.addr2,
            0x7f,
        ];
        for hw in 0..64u8 {
            let occupied = self.occupancy[usize::from(boardlink_types::chess_square(hw))] == 1;
            let base = if occupied {
                self.config.occupied_level
            } else {
                self.config.empty_level
            };
            let jitter = if self.config.sensor_jitter > 0 {
                rng.gen_range(0..=self.config.sensor_jitter)
            } else {
                0
            };
            let word = base.saturating_add(jitter);
            reply.push((word >> 8) as u8);
            reply.push((word & 0xff) as u8);
        }
        reply
    }
}
