//! Virtual message channels.
//!
//! A [`MessageChannel`] owns two linked [`MessagePort`]s. While neither end
//! has been handed to a connection, posting on one port delivers
//! synchronously to the other. Once a port is *transferred*, the pair's
//! traffic is rerouted through an installed send function, which is how a
//! port reaches across the process boundary.
//!
//! ```text
//!   local app                       connection                    remote
//!   port1.post_message ──send fn──▶ [channel 4] frame ──▶ remote port pair
//!   port1 listeners    ◀─receive fn── [channel 4] frame ◀──
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::event::{EventTarget, ListenerId, MessageEvent};
use crate::value::{Shared, Value};
use crate::wire::ChannelId;

/// Which end of the connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Owns the listening socket and waits for the `init` handshake.
    Host,
    /// Connects back to the host from inside the spawned runtime.
    Guest,
}

impl Side {
    /// The process-wide channel factory for this side.
    pub fn factory(self) -> &'static ChannelFactory {
        static HOST: OnceLock<ChannelFactory> = OnceLock::new();
        static GUEST: OnceLock<ChannelFactory> = OnceLock::new();
        match self {
            Side::Host => HOST.get_or_init(|| ChannelFactory::new(Side::Host)),
            Side::Guest => GUEST.get_or_init(|| ChannelFactory::new(Side::Guest)),
        }
    }
}

/// Allocates channel ids from a monotonically increasing counter.
///
/// Host ids are numbers and guest ids are strings, so the two id spaces
/// never collide on one connection. The counter is never reset.
#[derive(Debug)]
pub struct ChannelFactory {
    side: Side,
    next: AtomicU64,
}

impl ChannelFactory {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            next: AtomicU64::new(0),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn next_id(&self) -> ChannelId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        match self.side {
            Side::Host => ChannelId::Number(n),
            Side::Guest => ChannelId::String(format!("g{}", n)),
        }
    }

    /// Create a fresh channel with the next id.
    pub fn channel(&self) -> MessageChannel {
        MessageChannel::with_id(self.next_id())
    }
}

/// Outbound path of a transferred port: `(data, transfer list)`.
pub type SendFn = Arc<dyn Fn(Value, Vec<Transferable>) -> Result<()> + Send + Sync>;

/// Inbound path of a transferred port, called once per frame for its channel.
pub type ReceiveFn = Arc<dyn Fn(Value) + Send + Sync>;

/// A value whose control, not just its data, crosses the boundary.
#[derive(Clone)]
pub enum Transferable {
    Buffer(Shared<Buffer>),
    Port(MessagePort),
}

impl Transferable {
    pub fn as_port(&self) -> Option<&MessagePort> {
        match self {
            Transferable::Port(p) => Some(p),
            Transferable::Buffer(_) => None,
        }
    }
}

impl From<MessagePort> for Transferable {
    fn from(port: MessagePort) -> Self {
        Transferable::Port(port)
    }
}

impl fmt::Debug for Transferable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transferable::Buffer(b) => write!(f, "Buffer({:?})", b.lock().kind()),
            Transferable::Port(p) => write!(f, "Port({})", p.channel_id()),
        }
    }
}

/// A linked pair of ports sharing one channel id.
#[derive(Debug, Clone)]
pub struct MessageChannel {
    pub port1: MessagePort,
    pub port2: MessagePort,
}

impl MessageChannel {
    /// Create a channel with an id from `factory`.
    pub fn new(factory: &ChannelFactory) -> Self {
        factory.channel()
    }

    /// Create a channel with an explicit id, as when materializing a port
    /// that arrived from the remote side.
    pub fn with_id(id: ChannelId) -> Self {
        let port1 = MessagePort::unlinked(id.clone());
        let port2 = MessagePort::unlinked(id);
        MessagePort::link(&port1, &port2);
        Self { port1, port2 }
    }

    pub fn id(&self) -> &ChannelId {
        self.port1.channel_id()
    }
}

struct PortState {
    transferred: bool,
    peer: Weak<PortInner>,
    send: Option<SendFn>,
}

struct PortInner {
    channel_id: ChannelId,
    state: Mutex<PortState>,
    events: EventTarget<MessageEvent>,
}

impl PortInner {
    fn receive(&self, data: Value) {
        self.events.dispatch(&MessageEvent { data });
    }
}

/// One endpoint of a [`MessageChannel`].
///
/// Cloning a port yields another handle to the same endpoint. Ports refer
/// to their peer weakly; the channel (or whoever holds the ports) owns them.
#[derive(Clone)]
pub struct MessagePort {
    inner: Arc<PortInner>,
}

impl MessagePort {
    fn unlinked(channel_id: ChannelId) -> Self {
        Self {
            inner: Arc::new(PortInner {
                channel_id,
                state: Mutex::new(PortState {
                    transferred: false,
                    peer: Weak::new(),
                    send: None,
                }),
                events: EventTarget::new(),
            }),
        }
    }

    fn link(a: &MessagePort, b: &MessagePort) {
        a.inner.state.lock().peer = Arc::downgrade(&b.inner);
        b.inner.state.lock().peer = Arc::downgrade(&a.inner);
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.inner.channel_id
    }

    pub fn is_transferred(&self) -> bool {
        self.inner.state.lock().transferred
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &MessagePort) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Send `data` to the other end of the channel.
    ///
    /// Untransferred ports deliver synchronously to their peer. Transferred
    /// ports hand the message to the installed send function; a transferred
    /// port without one (the peer of the port that was handed over) drops
    /// the message.
    pub fn post_message(&self, data: Value, transfer: Vec<Transferable>) -> Result<()> {
        let (transferred, send, peer) = {
            let state = self.inner.state.lock();
            (state.transferred, state.send.clone(), state.peer.upgrade())
        };

        if transferred {
            match send {
                Some(send) => send(data, transfer),
                None => {
                    tracing::debug!(
                        channel = %self.inner.channel_id,
                        "transferred port has no send path, dropping message"
                    );
                    Ok(())
                }
            }
        } else {
            if let Some(peer) = peer {
                peer.receive(data);
            }
            Ok(())
        }
    }

    /// Hand this port's channel over to an external sender.
    ///
    /// Marks both ends transferred, installs `send` as the peer's outbound
    /// path and returns the function that delivers inbound messages to the
    /// peer's listeners.
    pub fn transfer(&self, send: SendFn) -> Result<ReceiveFn> {
        let peer = {
            let mut state = self.inner.state.lock();
            if state.transferred {
                return Err(Error::AlreadyTransferred(self.inner.channel_id.clone()));
            }
            let peer = state
                .peer
                .upgrade()
                .ok_or_else(|| Error::NotLinked(self.inner.channel_id.clone()))?;
            state.transferred = true;
            peer
        };

        {
            let mut peer_state = peer.state.lock();
            peer_state.transferred = true;
            peer_state.send = Some(send);
        }

        Ok(Arc::new(move |data| peer.receive(data)))
    }

    /// Install the `onmessage` handler.
    pub fn on_message(&self, handler: impl Fn(&MessageEvent) + Send + Sync + 'static) {
        self.inner.events.set_handler(handler);
    }

    pub fn add_message_listener(
        &self,
        listener: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.events.add_listener(listener)
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove_listener(id)
    }
}

impl fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePort")
            .field("channel_id", &self.inner.channel_id)
            .field("transferred", &self.is_transferred())
            .finish()
    }
}
