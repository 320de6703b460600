//! Half-duplex bus arbiter.
//!
//! Owns the serial stream (reader task + write half) and enforces the
//! single-outstanding-request invariant. Requests come in two priority
//! classes: normal commands are high priority; background polling reads are
//! low priority and get cancelled with a "skipped" result the moment a high
//! priority request shows up.
//!
//! The reader task also runs address discovery: the handshake requires two
//! consecutive `0x90` frames carrying the same address pair before the bus
//! reports ready.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use boardlink_types::{
    build_packet, scan_piece_events, Command, Packet, PacketParser, ParsedFrame, PieceEvent,
    PIECE_EVENT_RESP,
};

use super::transport::LinkStream;
use super::LinkError;

/// Delay between retry attempts of a timed-out request.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bound of the piece-event queue toward the demultiplexer. Overflow drops
/// events rather than blocking the reader.
const EVENT_QUEUE_BOUND: usize = 256;

const ADDRESS_RESP: u8 = 0x90;
const CHANGES_RESP: u8 = 0x85;
const KEY_NOTIFY_RESP: u8 = 0xa3;

/// Raw traffic handed to the event demultiplexer.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Piece lift/place events parsed out of a changes frame.
    Pieces(Vec<PieceEvent>),
    /// Undecoded key-notification payload.
    KeyReport(Vec<u8>),
    /// Battery frame payload (unsolicited).
    Battery(Vec<u8>),
}

enum WaiterOutcome {
    Payload(Vec<u8>),
    Skipped,
}

struct Waiter {
    expected: u8,
    low_priority: bool,
    tx: oneshot::Sender<WaiterOutcome>,
}

struct RawWaiter {
    target: usize,
    buf: Vec<u8>,
    low_priority: bool,
    tx: oneshot::Sender<Option<Vec<u8>>>,
}

struct BusInner {
    writer: Mutex<WriteHalf<Box<dyn LinkStream>>>,
    parser: StdMutex<PacketParser>,
    request_lock: Mutex<()>,
    waiter: StdMutex<Option<Waiter>>,
    raw_waiter: StdMutex<Option<RawWaiter>>,
    high_pending: AtomicUsize,
    address: StdMutex<(u8, u8)>,
    ready_tx: watch::Sender<bool>,
    event_tx: mpsc::Sender<LinkEvent>,
}

/// Handle to the bus. Cheap to clone; all clones share the single request
/// slot.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Split the transport, spawn the reader task, and kick off discovery.
    /// Returns the bus handle, the event stream for the demultiplexer, and
    /// the reader task handle.
    pub fn start(
        stream: Box<dyn LinkStream>,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Bus, mpsc::Receiver<LinkEvent>, JoinHandle<()>) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_BOUND);
        let (ready_tx, _) = watch::channel(false);

        let inner = Arc::new(BusInner {
            writer: Mutex::new(write_half),
            parser: StdMutex::new(PacketParser::new()),
            request_lock: Mutex::new(()),
            waiter: StdMutex::new(None),
            raw_waiter: StdMutex::new(None),
            high_pending: AtomicUsize::new(0),
            address: StdMutex::new((0, 0)),
            ready_tx,
            event_tx,
        });

        let bus = Bus {
            inner: inner.clone(),
        };
        let reader_bus = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = reader_bus.reader_loop(read_half) => {}
                _ = shutdown.changed() => {
                    info!("Link reader: shutdown");
                }
            }
        });
        (bus, event_rx, handle)
    }

    // ── Readiness / discovery ─────────────────────────────────────────────

    pub fn is_ready(&self) -> bool {
        *self.inner.ready_tx.borrow()
    }

    pub fn address(&self) -> (u8, u8) {
        *self.inner.address.lock().unwrap()
    }

    /// Zero the learned address and send the address query. The reader's
    /// discovery handler drives the rest.
    pub async fn begin_discovery(&self) -> Result<(), LinkError> {
        {
            let mut addr = self.inner.address.lock().unwrap();
            *addr = (0, 0);
        }
        self.inner.parser.lock().unwrap().set_address(0, 0);
        self.inner.ready_tx.send_replace(false);
        info!("Discovery: querying bus address");
        self.send_command(Command::ReturnBusAddress, None).await
    }

    /// Block until discovery completes, up to `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.ready_tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {
                    if *rx.borrow() {
                        return true;
                    }
                }
                _ => return *rx.borrow(),
            }
        }
    }

    // ── Request API ───────────────────────────────────────────────────────

    /// High-priority round trip: send `cmd`, wait for its response type.
    /// Retries on timeout with a 100 ms inter-attempt delay. Commands with
    /// no expected response return immediately after the write.
    pub async fn request(
        &self,
        cmd: Command,
        payload: Option<&[u8]>,
        timeout: Duration,
        retries: u32,
    ) -> Result<Vec<u8>, LinkError> {
        let spec = cmd.spec();
        let Some(expected) = spec.expected_resp else {
            self.send_command(cmd, payload).await?;
            return Ok(Vec::new());
        };

        let _pending = HighPending::enter(&self.inner);
        self.cancel_low_waiters();

        let lock_budget = timeout
            .checked_mul(retries + 1)
            .unwrap_or(Duration::from_secs(60));
        let _permit = tokio::time::timeout(lock_budget, self.inner.request_lock.lock())
            .await
            .map_err(|_| LinkError::Busy)?;

        for attempt in 0..=retries {
            let (tx, rx) = oneshot::channel();
            self.install_waiter(Waiter {
                expected,
                low_priority: false,
                tx,
            });
            if let Err(e) = self.send_command(cmd, payload).await {
                self.clear_waiter();
                return Err(e);
            }

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(WaiterOutcome::Payload(payload))) => return Ok(payload),
                Ok(Ok(WaiterOutcome::Skipped)) | Ok(Err(_)) | Err(_) => {
                    self.clear_waiter();
                }
            }
            if attempt < retries {
                debug!(
                    "Bus: retry {}/{} for {} after timeout",
                    attempt + 1,
                    retries,
                    spec.name
                );
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
        Err(LinkError::Timeout { expected })
    }

    /// Low-priority round trip: accepted only when no high-priority request
    /// is pending and the bus is idle. Cancelled with [`LinkError::Skipped`]
    /// if a high-priority request arrives first.
    pub async fn request_low(
        &self,
        cmd: Command,
        payload: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Vec<u8>, LinkError> {
        let spec = cmd.spec();
        let Some(expected) = spec.expected_resp else {
            return Err(LinkError::Skipped);
        };
        if self.inner.high_pending.load(Ordering::SeqCst) > 0 {
            return Err(LinkError::Skipped);
        }
        let _permit = self
            .inner
            .request_lock
            .try_lock()
            .map_err(|_| LinkError::Skipped)?;

        let (tx, rx) = oneshot::channel();
        self.install_waiter(Waiter {
            expected,
            low_priority: true,
            tx,
        });
        if let Err(e) = self.send_command(cmd, payload).await {
            self.clear_waiter();
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(WaiterOutcome::Payload(payload))) => Ok(payload),
            Ok(Ok(WaiterOutcome::Skipped)) => Err(LinkError::Skipped),
            Ok(Err(_)) | Err(_) => {
                self.clear_waiter();
                Err(LinkError::Timeout { expected })
            }
        }
    }

    /// Capture exactly `raw_len` bytes of the reply, bypassing the frame
    /// parser. Used for vendor commands whose replies carry no checksum.
    pub async fn request_raw(
        &self,
        cmd: Command,
        payload: Option<&[u8]>,
        raw_len: usize,
        timeout: Duration,
        low_priority: bool,
    ) -> Result<Vec<u8>, LinkError> {
        if low_priority {
            if self.inner.high_pending.load(Ordering::SeqCst) > 0 {
                return Err(LinkError::Skipped);
            }
        }
        let _pending = if low_priority {
            None
        } else {
            self.cancel_low_waiters();
            Some(HighPending::enter(&self.inner))
        };

        let _permit = if low_priority {
            match self.inner.request_lock.try_lock() {
                Ok(p) => p,
                Err(_) => return Err(LinkError::Skipped),
            }
        } else {
            tokio::time::timeout(timeout, self.inner.request_lock.lock())
                .await
                .map_err(|_| LinkError::Busy)?
        };

        // Stale bytes must not leak into the raw buffer.
        self.inner.parser.lock().unwrap().clear();

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.inner.raw_waiter.lock().unwrap();
            *slot = Some(RawWaiter {
                target: raw_len,
                buf: Vec::with_capacity(raw_len),
                low_priority,
                tx,
            });
        }
        if let Err(e) = self.send_command(cmd, payload).await {
            self.inner.raw_waiter.lock().unwrap().take();
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Some(bytes))) => Ok(bytes),
            Ok(Ok(None)) => Err(LinkError::Skipped),
            Ok(Err(_)) | Err(_) => {
                let collected = {
                    let mut slot = self.inner.raw_waiter.lock().unwrap();
                    slot.take().map(|w| w.buf.len()).unwrap_or(0)
                };
                debug!("Bus: raw timeout, wanted {raw_len} got {collected}");
                Err(LinkError::Timeout { expected: 0 })
            }
        }
    }

    /// Fire a command without waiting (LEDs, sounds).
    pub async fn send_command(
        &self,
        cmd: Command,
        payload: Option<&[u8]>,
    ) -> Result<(), LinkError> {
        let spec = cmd.spec();
        let data = match payload {
            Some(p) => Some(p.to_vec()),
            None => spec.default_payload.map(|d| d.to_vec()),
        };
        let (addr1, addr2) = self.address();
        let frame = build_packet(spec.cmd, addr1, addr2, data.as_deref());
        debug!(
            "Bus: send {} {}",
            spec.name,
            frame
                .iter()
                .take(16)
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" ")
        );
        self.write_frame(&frame).await?;

        // Fire-and-forget commands leave notifications disarmed; chase them
        // with a notify-enable so key/piece events keep flowing.
        if self.is_ready() && spec.expected_resp.is_none() && cmd != Command::NotifyEvents {
            self.write_notify_enable().await?;
        }
        Ok(())
    }

    async fn write_notify_enable(&self) -> Result<(), LinkError> {
        let spec = Command::NotifyEvents.spec();
        let (addr1, addr2) = self.address();
        let frame = build_packet(spec.cmd, addr1, addr2, None);
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), LinkError> {
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    // ── Waiter slot management ────────────────────────────────────────────

    fn install_waiter(&self, waiter: Waiter) {
        let mut slot = self.inner.waiter.lock().unwrap();
        if slot.is_some() {
            // The request lock should make this impossible.
            warn!("Bus: waiter slot occupied at install; replacing");
        }
        *slot = Some(waiter);
    }

    fn clear_waiter(&self) {
        self.inner.waiter.lock().unwrap().take();
    }

    /// Resolve any outstanding low-priority waiter to "skipped". Called by
    /// high-priority requests before they queue for the bus.
    fn cancel_low_waiters(&self) {
        let waiter = {
            let mut slot = self.inner.waiter.lock().unwrap();
            let is_low = matches!(slot.as_ref(), Some(w) if w.low_priority);
            if is_low {
                slot.take()
            } else {
                None
            }
        };
        if let Some(w) = waiter {
            let _ = w.tx.send(WaiterOutcome::Skipped);
        }
        let raw = {
            let mut slot = self.inner.raw_waiter.lock().unwrap();
            let is_low = matches!(slot.as_ref(), Some(w) if w.low_priority);
            if is_low {
                slot.take()
            } else {
                None
            }
        };
        if let Some(w) = raw {
            let _ = w.tx.send(None);
        }
    }

    // ── Reader ────────────────────────────────────────────────────────────

    async fn reader_loop(&self, mut reader: ReadHalf<Box<dyn LinkStream>>) {
        let mut buf = [0u8; 256];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    warn!("Link reader: stream closed");
                    self.inner.ready_tx.send_replace(false);
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    error!("Link reader: read error: {e}");
                    self.inner.ready_tx.send_replace(false);
                    return;
                }
            };

            for &byte in &buf[..n] {
                if self.consume_raw_byte(byte) {
                    continue;
                }
                let frames = self.inner.parser.lock().unwrap().feed(byte);
                for frame in frames {
                    self.handle_frame(frame).await;
                }
            }
        }
    }

    /// Returns true when the byte was swallowed by an active raw capture.
    fn consume_raw_byte(&self, byte: u8) -> bool {
        let mut slot = self.inner.raw_waiter.lock().unwrap();
        let Some(waiter) = slot.as_mut() else {
            return false;
        };
        waiter.buf.push(byte);
        let done = waiter.buf.len() >= waiter.target;
        if !done {
            return true;
        }
        let complete = slot.take();
        drop(slot);
        if let Some(waiter) = complete {
            let _ = waiter.tx.send(Some(waiter.buf));
        }
        true
    }

    async fn handle_frame(&self, frame: ParsedFrame) {
        match frame {
            ParsedFrame::Packet(packet) => {
                if !self.is_ready() {
                    self.handle_discovery(&packet).await;
                    return;
                }
                if self.deliver_to_waiter(packet.packet_type, &packet.payload) {
                    self.after_packet(packet.packet_type).await;
                    return;
                }
                self.route_unsolicited(&packet).await;
                self.after_packet(packet.packet_type).await;
            }
            ParsedFrame::Short {
                packet_type,
                payload,
            } => {
                if !self.is_ready() {
                    return;
                }
                if !self.deliver_to_waiter(packet_type, &payload) {
                    debug!("Bus: unsolicited short frame type 0x{packet_type:02x}");
                }
            }
            ParsedFrame::KeyReport(payload) => {
                if self.is_ready() {
                    self.push_event(LinkEvent::KeyReport(payload));
                    self.after_packet(KEY_NOTIFY_RESP).await;
                }
            }
            ParsedFrame::Orphaned(bytes) => {
                warn!(
                    "Bus: orphaned data: {}",
                    bytes
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect::<Vec<_>>()
                        .join(" ")
                );
            }
            ParsedFrame::ChecksumMismatch(bytes) => {
                info!("Bus: checksum mismatch on {}-byte frame, discarded", bytes.len());
            }
        }
    }

    fn deliver_to_waiter(&self, packet_type: u8, payload: &[u8]) -> bool {
        let waiter = {
            let mut slot = self.inner.waiter.lock().unwrap();
            let wanted = matches!(slot.as_ref(), Some(w) if w.expected == packet_type);
            if wanted {
                slot.take()
            } else {
                None
            }
        };
        match waiter {
            Some(w) => {
                let _ = w.tx.send(WaiterOutcome::Payload(payload.to_vec()));
                true
            }
            None => false,
        }
    }

    async fn route_unsolicited(&self, packet: &Packet) {
        match packet.packet_type {
            CHANGES_RESP => {
                let events = scan_piece_events(&packet.payload);
                if !events.is_empty() {
                    self.push_event(LinkEvent::Pieces(events));
                }
            }
            PIECE_EVENT_RESP => {
                // Doorbell only; the follow-up changes request carries the
                // actual events.
            }
            0xb5 => {
                self.push_event(LinkEvent::Battery(packet.payload.clone()));
            }
            other => {
                debug!("Bus: unhandled frame type 0x{other:02x}");
            }
        }
    }

    /// Keep the event stream armed: a piece-event doorbell triggers a
    /// changes request; event traffic re-enables notifications.
    async fn after_packet(&self, packet_type: u8) {
        let follow_up = match packet_type {
            PIECE_EVENT_RESP => Some(Command::SendChanges),
            CHANGES_RESP | KEY_NOTIFY_RESP => Some(Command::NotifyEvents),
            _ => None,
        };
        if let Some(cmd) = follow_up {
            // Skip while a request holds the bus; its own traffic re-arms.
            if self.inner.waiter.lock().unwrap().is_none() {
                if let Err(e) = self.send_follow_up(cmd).await {
                    warn!("Bus: follow-up {} failed: {e}", cmd.name());
                }
            }
        }
    }

    async fn send_follow_up(&self, cmd: Command) -> Result<(), LinkError> {
        let spec = cmd.spec();
        let (addr1, addr2) = self.address();
        let frame = build_packet(spec.cmd, addr1, addr2, None);
        self.write_frame(&frame).await
    }

    fn push_event(&self, event: LinkEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.inner.event_tx.try_send(event) {
            error!("Bus: piece event queue full, dropping event");
        }
    }

    async fn handle_discovery(&self, packet: &Packet) {
        if packet.packet_type != ADDRESS_RESP {
            debug!(
                "Discovery: ignoring frame type 0x{:02x}",
                packet.packet_type
            );
            return;
        }
        let learned = {
            let mut addr = self.inner.address.lock().unwrap();
            if *addr == (0, 0) {
                *addr = (packet.addr1, packet.addr2);
                None
            } else if *addr == (packet.addr1, packet.addr2) {
                Some(*addr)
            } else {
                info!(
                    "Discovery: address mismatch ({:02x},{:02x} vs {:02x},{:02x}), restarting",
                    addr.0, addr.1, packet.addr1, packet.addr2
                );
                *addr = (0, 0);
                Some((0, 0))
            }
        };

        match learned {
            None => {
                // First 0x90: remember the address, await confirmation.
                self.inner
                    .parser
                    .lock()
                    .unwrap()
                    .set_address(packet.addr1, packet.addr2);
            }
            Some((0, 0)) => {
                self.inner.parser.lock().unwrap().set_address(0, 0);
                if let Err(e) = self.send_command(Command::ReturnBusAddress, None).await {
                    warn!("Discovery: retry send failed: {e}");
                }
            }
            Some((a1, a2)) => {
                self.inner.ready_tx.send_replace(true);
                info!("Discovery: READY - addr1=0x{a1:02x} addr2=0x{a2:02x}");
                if let Err(e) = self.send_command(Command::NotifyEvents, None).await {
                    warn!("Discovery: notify enable failed: {e}");
                }
            }
        }
    }
}

struct HighPending {
    counter: Arc<BusInner>,
}

impl HighPending {
    fn enter(inner: &Arc<BusInner>) -> HighPending {
        inner.high_pending.fetch_add(1, Ordering::SeqCst);
        HighPending {
            counter: inner.clone(),
        }
    }
}

impl Drop for HighPending {
    fn drop(&mut self) {
        self.counter.high_pending.fetch_sub(1, Ordering::SeqCst);
    }
}
