//! Bytes exchanged over the companion socket. Every supported ABI is
//! little-endian, so the packets are plain `repr(C)` structs.

use crate::error::{Error, Result};
use crate::location::{LocationFix, Provider};
use bytemuck::{Pod, Zeroable};
use std::io::{Read, Write};
use strum_macros::{AsRefStr, FromRepr};

pub const PACKET_MAGIC: [u8; 4] = *b"MGPS";
pub const HELLO_MAGIC: [u8; 4] = *b"MGPH";
pub const VERSION: u16 = 1;
pub const MAX_PACKAGE_NAME: usize = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsRefStr, FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Command {
    Set = 1,
    Enable = 2,
    Disable = 3,
    Teardown = 4,
    SetAndEnable = 5,
}

/// A validated control request.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ControlMessage {
    Set(LocationFix),
    Enable,
    Disable,
    Teardown,
    SetAndEnable(LocationFix),
}

impl ControlMessage {
    pub fn command(&self) -> Command {
        match self {
            ControlMessage::Set(_) => Command::Set,
            ControlMessage::Enable => Command::Enable,
            ControlMessage::Disable => Command::Disable,
            ControlMessage::Teardown => Command::Teardown,
            ControlMessage::SetAndEnable(_) => Command::SetAndEnable,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct ControlPacket {
    pub magic: [u8; 4],
    pub version: u16,
    pub command: u8,
    pub provider: u8,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f32,
    pub speed: f32,
    pub bearing: f32,
    pub reserved: u32,
}

pub const PACKET_SIZE: usize = size_of::<ControlPacket>();

const _: () = assert!(PACKET_SIZE == 48);

impl ControlPacket {
    pub fn encode(message: &ControlMessage) -> Self {
        let mut packet = ControlPacket {
            magic: PACKET_MAGIC,
            version: VERSION,
            command: message.command() as u8,
            ..Default::default()
        };

        if let ControlMessage::Set(fix) | ControlMessage::SetAndEnable(fix) = message {
            packet.provider = fix.provider as u8;
            packet.latitude = fix.latitude;
            packet.longitude = fix.longitude;
            packet.altitude = fix.altitude;
            packet.accuracy = fix.accuracy;
            packet.speed = fix.speed;
            packet.bearing = fix.bearing;
        }

        packet
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Checks framing, command and value ranges. Never trusts the peer.
    pub fn decode(bytes: &[u8]) -> Result<ControlMessage> {
        if bytes.len() != PACKET_SIZE {
            return Err(Error::configuration(format!("packet of {} bytes", bytes.len())));
        }

        let packet: ControlPacket = bytemuck::pod_read_unaligned(bytes);

        if packet.magic != PACKET_MAGIC {
            return Err(Error::configuration(format!("bad magic {:02x?}", packet.magic)));
        }

        if packet.version != VERSION {
            return Err(Error::configuration(format!("unsupported version {}", packet.version)));
        }

        let command = Command::from_repr(packet.command)
            .ok_or_else(|| Error::configuration(format!("unknown command {}", packet.command)))?;

        Ok(match command {
            Command::Set => ControlMessage::Set(packet.fix()?),
            Command::SetAndEnable => ControlMessage::SetAndEnable(packet.fix()?),
            Command::Enable => ControlMessage::Enable,
            Command::Disable => ControlMessage::Disable,
            Command::Teardown => ControlMessage::Teardown,
        })
    }

    fn fix(&self) -> Result<LocationFix> {
        let provider = Provider::from_repr(self.provider as u32)
            .ok_or_else(|| Error::configuration(format!("unknown provider {}", self.provider)))?;

        LocationFix::new(self.latitude, self.longitude)
            .with_altitude(self.altitude)
            .with_accuracy(self.accuracy)
            .with_motion(self.speed, self.bearing)
            .with_provider(provider)
            .stamped()
            .validated()
    }
}

#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
#[repr(C)]
struct HelloHeader {
    magic: [u8; 4],
    version: u16,
    name_len: u16,
    uid: u32,
}

/// First thing an app process sends to its companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub uid: u32,
    pub package_name: String,
}

impl Hello {
    pub fn new<S: Into<String>>(uid: u32, package_name: S) -> Self {
        Self {
            uid,
            package_name: package_name.into(),
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let name = self.package_name.as_bytes();
        if name.is_empty() || name.len() > MAX_PACKAGE_NAME {
            return Err(Error::Channel(format!("package name of {} bytes", name.len())));
        }

        let header = HelloHeader {
            magic: HELLO_MAGIC,
            version: VERSION,
            name_len: name.len() as u16,
            uid: self.uid,
        };

        let mut frame = Vec::with_capacity(size_of::<HelloHeader>() + name.len());
        frame.extend_from_slice(bytemuck::bytes_of(&header));
        frame.extend_from_slice(name);
        writer.write_all(&frame)?;

        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = HelloHeader::default();
        reader.read_exact(bytemuck::bytes_of_mut(&mut header))?;

        if header.magic != HELLO_MAGIC || header.version != VERSION {
            return Err(Error::Channel(format!(
                "bad handshake {:02x?} v{}",
                header.magic, header.version
            )));
        }

        let len = header.name_len as usize;
        if len == 0 || len > MAX_PACKAGE_NAME {
            return Err(Error::Channel(format!("package name of {len} bytes")));
        }

        let mut name = vec![0u8; len];
        reader.read_exact(&mut name)?;

        let package_name = String::from_utf8(name).map_err(|_| Error::Channel("package name is not utf-8".into()))?;

        Ok(Hello::new(header.uid, package_name))
    }
}
