//! Control Channel: applies controller requests to the coordinate store.

mod source;
pub mod wire;

pub use source::{Closer, ControlSource, Event, LocalSender, LocalSource, StreamSource};
pub use wire::{Command, ControlMessage, ControlPacket, Hello};

use crate::config::{ChannelConfig, DisconnectPolicy};
use crate::error::Result;
use crate::store::CoordinateStore;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const THREAD_NAME: &str = "mockgps-channel";

/// What the listener drives.
pub trait ControlSink: Send + Sync {
    fn store(&self) -> &CoordinateStore;

    /// Handles a `teardown` request.
    fn teardown(&self);

    /// Periodic housekeeping between messages; `true` while there is more to
    /// do after the controller is gone.
    fn tick(&self) -> bool {
        false
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Applied {
    Updated { generation: u64 },
    Teardown,
}

/// Applies one message. Invalid fixes leave the store as it was.
pub fn apply(store: &CoordinateStore, message: ControlMessage) -> Result<Applied> {
    let generation = match message {
        ControlMessage::Set(fix) => store.update(fix)?,
        ControlMessage::SetAndEnable(fix) => store.apply(fix, true)?,
        ControlMessage::Enable => store.set_enabled(true),
        ControlMessage::Disable => store.set_enabled(false),
        ControlMessage::Teardown => return Ok(Applied::Teardown),
    };

    Ok(Applied::Updated { generation })
}

/// Applies the disconnect policy. Runs once per channel.
pub fn on_disconnect(store: &CoordinateStore, policy: DisconnectPolicy) {
    match policy {
        DisconnectPolicy::Retain => info!("controller gone, keeping last location"),
        DisconnectPolicy::Disable => {
            info!("controller gone, passing through");
            store.set_enabled(false);
        }
    }
}

#[derive(Debug, Default)]
pub struct ChannelStats {
    applied: AtomicU64,
    rejected: AtomicU64,
    disconnected: AtomicBool,
}

impl ChannelStats {
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

/// The running listener.
pub struct ChannelHandle {
    stop: Arc<AtomicBool>,
    closer: Option<Closer>,
    stats: Arc<ChannelStats>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelHandle {
    /// Stops the listener and hangs up on the controller. Neither blocks
    /// nor allocates.
    pub fn release(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(closer) = &self.closer {
            closer.close();
        }
    }

    pub fn is_released(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Waits for the listener to exit. A no-op on the listener itself.
    pub fn join(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };

        if thread.thread().id() == thread::current().id() {
            return;
        }

        let _ = thread.join();
    }
}

struct Listener<S> {
    source: Box<dyn ControlSource>,
    sink: Arc<S>,
    policy: DisconnectPolicy,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
    stats: Arc<ChannelStats>,
}

impl<S: ControlSink> Listener<S> {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run(mut self) {
        debug!("control channel listening");

        while !self.stopped() {
            let event = self.source.recv(self.poll_interval);

            if self.stopped() {
                return;
            }

            match event {
                Ok(Event::Message(message)) => {
                    if self.handle(message) {
                        return;
                    }
                }
                Ok(Event::Rejected(err)) => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("rejected control packet: {err}");
                }
                Ok(Event::Idle) => {}
                Ok(Event::Closed) => break,
                Err(err) => {
                    warn!("control channel failed: {err}");
                    break;
                }
            }

            self.sink.tick();
        }

        if self.stopped() {
            return;
        }

        self.stats.disconnected.store(true, Ordering::Release);
        on_disconnect(self.sink.store(), self.policy);

        while !self.stopped() && self.sink.tick() {
            thread::sleep(self.poll_interval);
        }
    }

    /// `true` once the listener should exit.
    fn handle(&self, message: ControlMessage) -> bool {
        let command = message.command();

        match apply(self.sink.store(), message) {
            Ok(Applied::Updated { generation }) => {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
                debug!("applied {}, generation {generation}", command.as_ref());
                false
            }
            Ok(Applied::Teardown) => {
                info!("teardown requested by controller");
                self.sink.teardown();
                true
            }
            Err(err) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("rejected {}: {err}", command.as_ref());
                false
            }
        }
    }
}

/// Starts the listener thread.
pub fn spawn<S>(source: Box<dyn ControlSource>, sink: Arc<S>, config: &ChannelConfig) -> io::Result<ChannelHandle>
where
    S: ControlSink + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(ChannelStats::default());
    let closer = source.closer();

    let listener = Listener {
        source,
        sink,
        policy: config.on_disconnect,
        poll_interval: config.poll_interval(),
        stop: stop.clone(),
        stats: stats.clone(),
    };

    let thread = thread::Builder::new()
        .name(THREAD_NAME.into())
        .spawn(move || listener.run())?;

    Ok(ChannelHandle {
        stop,
        closer,
        stats,
        thread: Mutex::new(Some(thread)),
    })
}
