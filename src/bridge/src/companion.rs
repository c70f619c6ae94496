//! Root side of the control channel, running inside the Zygisk daemon.
//!
//! Each app process that passed the target filter connects once. The
//! companion answers its handshake with the current state from
//! `location.conf`, then pushes every change to the file until the app
//! hangs up.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use mockgps_core::channel::{ControlMessage, ControlPacket, Hello};
use mockgps_core::config::{LOCATION_FILE, LocationConfig};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use nix::sys::socket::{MsgFlags, send};
use std::ffi::OsStr;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MODULE_DIR: &str = "/data/adb/modules/mockgps";

const HELLO_TIMEOUT: Duration = Duration::from_secs(2);

/// Entry point registered with the daemon.
pub fn serve(stream: UnixStream) {
    crate::init_logger(crate::COMPANION_TAG);

    let result = Companion::accept(stream, Path::new(MODULE_DIR)).and_then(Companion::run);
    if let Err(err) = result {
        warn!("companion session ended: {err:?}");
    }
}

/// The state a `location.conf` asks for, as one message.
pub fn state_message(config: &LocationConfig) -> ControlMessage {
    if config.enabled {
        ControlMessage::SetAndEnable(config.fix)
    } else {
        ControlMessage::Disable
    }
}

pub struct Companion {
    stream: UnixStream,
    dir: PathBuf,
    hello: Hello,
    last: Option<ControlMessage>,
}

impl Companion {
    /// Reads the app's handshake.
    pub fn accept<P: AsRef<Path>>(stream: UnixStream, dir: P) -> Result<Self> {
        stream.set_read_timeout(Some(HELLO_TIMEOUT))?;
        let hello = Hello::read_from(&mut &stream).context("bad handshake")?;
        stream.set_read_timeout(None)?;

        info!("serving {} (uid {})", hello.package_name, hello.uid);

        Ok(Self {
            stream,
            dir: dir.as_ref().to_path_buf(),
            hello,
            last: None,
        })
    }

    fn current(&self) -> ControlMessage {
        match LocationConfig::load(self.dir.join(LOCATION_FILE)) {
            Ok(config) => state_message(&config),
            Err(err) => {
                debug!("{LOCATION_FILE} unusable, spoofing off: {err}");
                ControlMessage::Disable
            }
        }
    }

    fn push(&mut self, message: ControlMessage) -> Result<()> {
        if self.last == Some(message) {
            return Ok(());
        }

        let packet = ControlPacket::encode(&message);
        let mut bytes = packet.as_bytes();

        // MSG_NOSIGNAL: a vanished app must not take the daemon down with SIGPIPE
        while !bytes.is_empty() {
            match send(self.stream.as_raw_fd(), bytes, MsgFlags::MSG_NOSIGNAL) {
                Ok(sent) => bytes = &bytes[sent..],
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("push failed"),
            }
        }

        debug!("pushed {} to {}", message.command().as_ref(), self.hello.package_name);
        self.last = Some(message);

        Ok(())
    }

    /// Whether the app closed its end. It never sends after the handshake.
    fn hung_up(&mut self) -> bool {
        let mut buffer = [0u8; 64];

        match self.stream.read(&mut buffer) {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) => !matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted),
        }
    }

    /// Sends the current state, then every change, until the app goes away.
    pub fn run(mut self) -> Result<()> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)?;
        inotify
            .add_watch(
                &self.dir,
                AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO | AddWatchFlags::IN_DELETE,
            )
            .with_context(|| format!("cannot watch {}", self.dir.display()))?;

        self.push(self.current())?;

        loop {
            let (app, changes) = {
                let mut fds = [
                    PollFd::new(self.stream.as_fd(), PollFlags::POLLIN),
                    PollFd::new(inotify.as_fd(), PollFlags::POLLIN),
                ];

                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(err.into()),
                }

                (
                    fds[0].revents().unwrap_or(PollFlags::empty()),
                    fds[1].revents().unwrap_or(PollFlags::empty()),
                )
            };

            if app.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) && self.hung_up() {
                info!("{} hung up", self.hello.package_name);
                return Ok(());
            }

            if changes.contains(PollFlags::POLLIN) {
                let touched = match inotify.read_events() {
                    Ok(events) => events
                        .iter()
                        .any(|event| event.name.as_deref() == Some(OsStr::new(LOCATION_FILE))),
                    Err(Errno::EAGAIN) => false,
                    Err(err) => return Err(err.into()),
                };

                if touched {
                    self.push(self.current())?;
                }
            }
        }
    }
}
