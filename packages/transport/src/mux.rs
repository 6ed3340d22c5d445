//! The transport multiplexer.
//!
//! One physical connection carries the top-level message stream plus any
//! number of virtual port channels. Every outbound message becomes exactly
//! one text frame; frames tagged with a `channel` id are routed to the port
//! registered under that id, untagged frames go to the top-level listeners.
//!
//! ```text
//!  post_message(None, data)        ──▶ {"root":...}              ──▶ onmessage
//!  port.post_message(data)         ──▶ {"root":...,"channel":4}  ──▶ port 4 listeners
//! ```
//!
//! The host side holds outbound frames until the guest has sent the
//! `{"type":"init"}` handshake, then flushes them in call order.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, trace};

use isoworker_structure::{
    deserialize, serialize, ChannelId, EventTarget, ListenerId, MessageChannel, MessageEvent,
    MessagePort, ReceiveFn, Side, Structure, Transferable, Value,
};

use crate::error::Result;

/// The handshake payload the guest sends once it is ready.
pub fn init_message() -> Value {
    Value::object([("type", Value::from("init"))])
}

fn is_init(data: &Value) -> bool {
    matches!(data.get("type"), Some(Value::String(kind)) if kind == "init")
}

struct PortRoute {
    port: MessagePort,
    receive: ReceiveFn,
}

struct MuxState {
    available: bool,
    pending: Vec<String>,
    outbound: Option<UnboundedSender<String>>,
    ports: HashMap<ChannelId, PortRoute>,
    /// Set by `close`; every later frame is discarded.
    closed: bool,
}

struct MuxShared {
    side: Side,
    state: Mutex<MuxState>,
    events: EventTarget<MessageEvent>,
    handshake: watch::Sender<bool>,
}

/// Routes messages for one connection.
///
/// Cloning yields another handle to the same multiplexer.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

impl Multiplexer {
    pub fn new(side: Side) -> Self {
        Self {
            shared: Arc::new(MuxShared {
                side,
                state: Mutex::new(MuxState {
                    // The guest is ready as soon as it is connected.
                    available: side == Side::Guest,
                    pending: Vec::new(),
                    outbound: None,
                    ports: HashMap::new(),
                    closed: false,
                }),
                events: EventTarget::new(),
                handshake: watch::Sender::new(side == Side::Guest),
            }),
        }
    }

    pub fn side(&self) -> Side {
        self.shared.side
    }

    /// Whether the handshake has completed.
    pub fn is_available(&self) -> bool {
        self.shared.state.lock().available
    }

    /// Resolves once the handshake has completed.
    pub async fn wait_available(&self) {
        let mut available = self.shared.handshake.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = available.wait_for(|ready| *ready).await;
    }

    /// Create a channel whose id comes from this side's id space.
    pub fn channel(&self) -> MessageChannel {
        MessageChannel::new(self.shared.side.factory())
    }

    /// Send `data`, tagged with `channel` when it belongs to a port.
    ///
    /// Ports in `transfer` that have not been transferred yet are registered
    /// with this multiplexer first, so their traffic flows through the same
    /// connection.
    pub fn post_message(
        &self,
        channel: Option<ChannelId>,
        data: Value,
        transfer: Vec<Transferable>,
    ) -> isoworker_structure::Result<()> {
        self.shared.post_message(channel, &data, &transfer)
    }

    /// Handle one inbound text frame.
    pub fn receive_frame(&self, text: &str) -> Result<()> {
        let structure: Structure = serde_json::from_str(text)?;
        let decoded = deserialize(&structure)?;
        self.shared.register(&decoded.transferred)?;
        let data = decoded.data;

        let flushed = {
            let mut state = self.shared.state.lock();
            if !state.available && structure.channel.is_none() && is_init(&data) {
                state.available = true;
                debug!(pending = state.pending.len(), "handshake complete");
                Some(state.flush())
            } else {
                None
            }
        };
        if let Some(flushed) = flushed {
            trace!(flushed, "flushed pending frames");
            self.shared.handshake.send_replace(true);
            return Ok(());
        }

        match structure.channel {
            Some(id) => {
                let receive = self
                    .shared
                    .state
                    .lock()
                    .ports
                    .get(&id)
                    .map(|route| route.receive.clone());
                match receive {
                    Some(receive) => receive(data),
                    None => debug!(channel = %id, "no port registered for channel, dropping"),
                }
            }
            None => self.shared.events.dispatch(&MessageEvent { data }),
        }
        Ok(())
    }

    /// Connect the outbound side to a writer.
    ///
    /// A guest announces itself with the `init` handshake as the very first
    /// frame. Frames queued while detached are flushed behind it once the
    /// connection is available.
    pub fn attach(&self) -> Result<UnboundedReceiver<String>> {
        let (tx, rx) = unbounded_channel();
        if self.shared.side == Side::Guest {
            let init = serialize(&init_message())?.to_json()?;
            // The receiver is still in hand, so this cannot fail.
            let _ = tx.send(init);
        }
        let mut state = self.shared.state.lock();
        if state.closed {
            // Dropping the sender ends the pump right away.
            return Ok(rx);
        }
        state.outbound = Some(tx);
        if state.available {
            state.flush();
        }
        Ok(rx)
    }

    /// Disconnect the outbound side. Later frames are queued again.
    pub fn detach(&self) {
        self.shared.state.lock().outbound = None;
    }

    /// Stop carrying frames for good.
    ///
    /// Drops every port route, the queued frames and the writer. Frames
    /// posted afterwards are discarded instead of queued.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.ports.clear();
        state.pending.clear();
        state.outbound = None;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of frames waiting for the handshake or a writer.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Number of ports currently routed through this connection.
    pub fn port_count(&self) -> usize {
        self.shared.state.lock().ports.len()
    }

    /// The transferred port registered for `id`, if any.
    pub fn routed_port(&self, id: &ChannelId) -> Option<MessagePort> {
        self.shared
            .state
            .lock()
            .ports
            .get(id)
            .map(|route| route.port.clone())
    }

    /// Install the top-level `onmessage` handler.
    pub fn on_message(&self, handler: impl Fn(&MessageEvent) + Send + Sync + 'static) {
        self.shared.events.set_handler(handler);
    }

    pub fn add_message_listener(
        &self,
        listener: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared.events.add_listener(listener)
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.shared.events.remove_listener(id)
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Multiplexer")
            .field("side", &self.shared.side)
            .field("available", &state.available)
            .field("pending", &state.pending.len())
            .field("attached", &state.outbound.is_some())
            .field("ports", &state.ports.len())
            .finish()
    }
}

impl MuxState {
    /// Move queued frames to the writer in FIFO order.
    fn flush(&mut self) -> usize {
        let Some(outbound) = self.outbound.clone() else {
            return 0;
        };
        let count = self.pending.len();
        for frame in std::mem::take(&mut self.pending) {
            if outbound.send(frame).is_err() {
                // The writer is gone; the connection is closing.
                self.outbound = None;
                break;
            }
        }
        count
    }

    fn write(&mut self, frame: String) {
        if self.closed {
            trace!("multiplexer closed, dropping frame");
            return;
        }
        let outbound = match (&self.outbound, self.available) {
            (Some(outbound), true) => outbound.clone(),
            _ => {
                self.pending.push(frame);
                return;
            }
        };
        if let Err(rejected) = outbound.send(frame) {
            self.outbound = None;
            self.pending.push(rejected.0);
        }
    }
}

impl MuxShared {
    fn post_message(
        self: &Arc<Self>,
        channel: Option<ChannelId>,
        data: &Value,
        transfer: &[Transferable],
    ) -> isoworker_structure::Result<()> {
        self.register(transfer)?;

        let mut structure = serialize(data)?;
        structure.channel = channel;
        let frame = structure.to_json()?;

        self.state.lock().write(frame);
        Ok(())
    }

    /// Route each untransferred port in `transfer` through this connection.
    fn register(self: &Arc<Self>, transfer: &[Transferable]) -> isoworker_structure::Result<()> {
        for port in transfer.iter().filter_map(Transferable::as_port) {
            if port.is_transferred() {
                continue;
            }
            let id = port.channel_id().clone();
            let mux: Weak<MuxShared> = Arc::downgrade(self);
            let channel = id.clone();
            let receive = port.transfer(Arc::new(move |data, transfer| match mux.upgrade() {
                Some(mux) => mux.post_message(Some(channel.clone()), &data, &transfer),
                None => Ok(()),
            }))?;
            debug!(channel = %id, "registered port");
            self.state.lock().ports.insert(
                id,
                PortRoute {
                    port: port.clone(),
                    receive,
                },
            );
        }
        Ok(())
    }
}
