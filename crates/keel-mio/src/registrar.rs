use std::{
    mem,
    os::fd::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};

use anyhow::{Context as _, Error};
use mio::{event::Event, unix::SourceFd, Interest, Registry, Token, Waker};
use thiserror::Error;
use tracing::{event, instrument, Level};

use crate::WAKER_TOKEN;

const DISARMED: u8 = 0;
const ARMED_READ: u8 = 1;
const ARMED_WRITE: u8 = 2;

/// Shared registration context, one instance per server.
///
/// Owns a handle to the mio registry, the live-connection counter, and the list of tokens
/// retired since the event loop last looked. It's `Sync`, and given to every component that
/// needs to touch registrations.
pub struct Registrar {
    registry: Registry,
    waker: Waker,
    next_token: AtomicUsize,
    live: AtomicUsize,
    retired: Mutex<Vec<Token>>,
    stopping: AtomicBool,
}

impl Registrar {
    /// Create a registrar for the given poll registry.
    pub fn new(registry: &Registry) -> Result<Self, RegisterError> {
        let registry = registry
            .try_clone()
            .context("failed to clone mio registry")?;
        let waker = Waker::new(&registry, WAKER_TOKEN).context("failed to create waker")?;

        Ok(Self {
            registry,
            waker,
            next_token: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            retired: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        })
    }

    /// Create a new unique token for this registrar.
    pub fn token(&self) -> Token {
        let index = self.next_token.fetch_add(1, Ordering::SeqCst);
        Token(index)
    }

    /// Subscribe a descriptor for read-readiness and peer hang-up, edge-triggered.
    ///
    /// The descriptor must already be non-blocking, which all mio sockets are. If `oneshot`,
    /// the registration disarms itself when an event is claimed, and won't deliver again
    /// until re-armed.
    #[instrument("Registrar::register", level = "trace", skip_all)]
    pub fn register(&self, fd: RawFd, oneshot: bool) -> Result<Registration, RegisterError> {
        let token = self.token();

        self.registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
            .context("failed to register descriptor")?;
        let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;

        event!(Level::TRACE, ?token, live, "registered");

        let registration = Registration {
            token,
            fd,
            oneshot,
            armed: AtomicU8::new(ARMED_READ),
            rearming: Mutex::new(()),
        };
        Ok(registration)
    }

    /// Re-subscribe for exactly one readiness direction.
    ///
    /// The new direction is armed before the descriptor is modified, so an event raised by the
    /// modification itself is claimable. Re-arms of one registration are serialized, the armed
    /// direction always matches the interest last given to the registry.
    pub fn rearm(
        &self,
        registration: &Registration,
        direction: Direction,
    ) -> Result<(), RegisterError> {
        let _rearming = registration
            .rearming
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        registration
            .armed
            .store(direction.state(), Ordering::Release);

        let result = self.registry.reregister(
            &mut SourceFd(&registration.fd),
            registration.token,
            direction.interest(),
        );

        if let Err(error) = result {
            registration.armed.store(DISARMED, Ordering::Release);
            return Err(Error::from(error).context("failed to re-arm descriptor").into());
        }

        event!(Level::TRACE, token = ?registration.token, ?direction, "re-armed");

        Ok(())
    }

    /// Remove a subscription and close its descriptor, by dropping the source.
    ///
    /// The live-connection counter is decremented and the token retired even if removing the
    /// subscription fails, the descriptor is closed either way.
    pub fn unregister<S>(&self, source: S, registration: &Registration) -> Result<(), RegisterError>
    where
        S: AsRawFd,
    {
        registration.armed.store(DISARMED, Ordering::Release);

        let fd = source.as_raw_fd();
        let result = self.registry.deregister(&mut SourceFd(&fd));
        drop(source);

        let live = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
        event!(Level::TRACE, token = ?registration.token, live, "unregistered");

        self.retire(registration.token);

        result.context("failed to deregister descriptor")?;
        Ok(())
    }

    /// Number of currently registered connections.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Tell the event loop to stop, waking it if it's waiting.
    pub fn stop(&self) -> Result<(), RegisterError> {
        self.stopping.store(true, Ordering::Release);
        self.waker.wake().context("failed to wake event loop")?;
        Ok(())
    }

    /// Returns true once `stop` has been called.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Take all tokens unregistered since the last call.
    pub fn take_retired(&self) -> Vec<Token> {
        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        mem::take(&mut *retired)
    }

    fn retire(&self, token: Token) {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token);

        // Let the event loop drop its reference, failing to wake just delays that
        if let Err(error) = self.waker.wake() {
            event!(Level::WARN, ?error, "failed to wake event loop");
        }
    }
}

/// A descriptor's subscription with a `Registrar`.
pub struct Registration {
    token: Token,
    fd: RawFd,
    oneshot: bool,
    armed: AtomicU8,
    /// Held across storing a direction and modifying the descriptor.
    rearming: Mutex<()>,
}

impl Registration {
    /// Token events for this registration are delivered with.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The direction currently armed, if any.
    pub fn armed(&self) -> Option<Direction> {
        Direction::from_state(self.armed.load(Ordering::Acquire))
    }

    /// Claim a delivered event.
    ///
    /// Returns the armed direction if the event matches it, or reports a hang-up or error.
    /// Stale events, delivered for a direction that isn't armed, are ignored. One-shot
    /// registrations are disarmed by a successful claim, so the caller becomes the only owner
    /// of the source until it re-arms.
    pub fn claim(&self, ready: &Ready) -> Option<Direction> {
        let state = self.armed.load(Ordering::Acquire);
        let direction = Direction::from_state(state)?;

        let matches = ready.hangup
            || match direction {
                Direction::Read => ready.readable,
                Direction::Write => ready.writable,
            };
        if !matches {
            return None;
        }

        if !self.oneshot {
            return Some(direction);
        }

        self.armed
            .compare_exchange(state, DISARMED, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| direction)
    }
}

/// Readiness direction a registration can be armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Read-interest.
    Read,
    /// Write-interest.
    Write,
}

impl Direction {
    fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }

    fn state(self) -> u8 {
        match self {
            Direction::Read => ARMED_READ,
            Direction::Write => ARMED_WRITE,
        }
    }

    fn from_state(state: u8) -> Option<Self> {
        match state {
            ARMED_READ => Some(Direction::Read),
            ARMED_WRITE => Some(Direction::Write),
            _ => None,
        }
    }
}

/// Readiness reported for a registered source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    /// Source is readable.
    pub readable: bool,
    /// Source is writable.
    pub writable: bool,
    /// Peer hung up, or the source reported an error.
    pub hangup: bool,
}

impl From<&Event> for Ready {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_read_closed() || event.is_write_closed() || event.is_error(),
        }
    }
}

/// Failed to change a registration.
#[derive(Error, Debug)]
#[error("registration failed")]
pub struct RegisterError {
    #[from]
    source: Error,
}
