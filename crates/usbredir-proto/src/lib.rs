// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message-level implementation of the usbredir wire protocol.
//!
//! This crate knows nothing about device emulation: it converts between the
//! byte-for-byte framing spoken by unmodified usbredir peers and typed
//! [`Message`] values. Framing is little-endian throughout. Every frame is a
//! fixed header (type, body length, packet id) followed by a message body;
//! several body layouts grow optional trailing fields once the corresponding
//! [`Capability`] has been negotiated, so both the [`Encoder`] and the
//! [`Decoder`] carry the negotiated capability set.

use strum::FromRepr;
use thiserror::Error;

mod wire;

pub use wire::{Decoder, Encoder};

/// Number of `u32` words in a capabilities bitmap.
pub const CAPS_WORDS: usize = 1;

/// Fixed size of the NUL-padded version string in a hello body.
pub const HELLO_VERSION_LEN: usize = 64;

/// Maximum interface/endpoint slots described by info messages.
pub const INFO_SLOTS: usize = 32;

/// Upper bound on a single message body, header excluded. Anything larger is
/// treated as a malformed frame rather than an allocation request.
pub const MAX_BODY_LEN: usize = 1 << 20;

/// Protocol capability bits, negotiated via the hello exchange.
#[repr(u32)]
#[derive(FromRepr, Copy, Clone, Debug, Eq, PartialEq)]
pub enum Capability {
    BulkStreams = 0,
    ConnectDeviceVersion = 1,
    Filter = 2,
    DeviceDisconnectAck = 3,
    EpInfoMaxPacketSize = 4,
    Ids64Bit = 5,
    BulkLength32Bit = 6,
    BulkReceiving = 7,
}

/// A capabilities bitmap as carried in a hello body.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Caps([u32; CAPS_WORDS]);

impl Caps {
    pub const fn empty() -> Self {
        Self([0; CAPS_WORDS])
    }

    pub fn from_words(words: &[u32]) -> Self {
        let mut caps = Self::empty();
        for (dst, src) in caps.0.iter_mut().zip(words) {
            *dst = *src;
        }
        caps
    }

    pub fn words(&self) -> &[u32; CAPS_WORDS] {
        &self.0
    }

    #[must_use]
    pub fn with(mut self, cap: Capability) -> Self {
        self.0[cap as usize / 32] |= 1 << (cap as usize % 32);
        self
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.0[cap as usize / 32] & (1 << (cap as usize % 32)) != 0
    }

    /// Capabilities usable on a session: those both sides advertised.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let mut out = Self::empty();
        for (dst, (a, b)) in out.0.iter_mut().zip(self.0.iter().zip(other.0)) {
            *dst = a & b;
        }
        out
    }
}

/// Wire identifiers for each message type.
#[repr(u32)]
#[derive(FromRepr, Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageType {
    Hello = 0,
    DeviceConnect = 1,
    DeviceDisconnect = 2,
    Reset = 3,
    InterfaceInfo = 4,
    EpInfo = 5,
    SetConfiguration = 6,
    GetConfiguration = 7,
    ConfigurationStatus = 8,
    SetAltSetting = 9,
    GetAltSetting = 10,
    AltSettingStatus = 11,
    CancelDataPacket = 21,
    ControlPacket = 100,
    BulkPacket = 101,
}

/// Resolution status carried by data packets and status replies.
#[repr(u8)]
#[derive(FromRepr, Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferStatus {
    Success = 0,
    Cancelled = 1,
    Invalid = 2,
    IoError = 3,
    Stall = 4,
    Timeout = 5,
    Babble = 6,
}

impl TransferStatus {
    pub fn from_wire(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or(Self::IoError)
    }
}

/// Device speeds advertised by `device_connect`.
#[repr(u8)]
#[derive(FromRepr, Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceSpeed {
    Low = 0,
    Full = 1,
    High = 2,
    Super = 3,
    Unknown = 255,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Hello {
    /// Free-form version banner, truncated to [`HELLO_VERSION_LEN`] - 1.
    pub version: String,
    pub caps: Caps,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceConnect {
    pub speed: u8,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Only on the wire when [`Capability::ConnectDeviceVersion`] is
    /// negotiated.
    pub device_version_bcd: u16,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InterfaceInfo {
    pub interface_count: u32,
    pub interface: [u8; INFO_SLOTS],
    pub interface_class: [u8; INFO_SLOTS],
    pub interface_subclass: [u8; INFO_SLOTS],
    pub interface_protocol: [u8; INFO_SLOTS],
}

impl Default for InterfaceInfo {
    fn default() -> Self {
        Self {
            interface_count: 0,
            interface: [0; INFO_SLOTS],
            interface_class: [0; INFO_SLOTS],
            interface_subclass: [0; INFO_SLOTS],
            interface_protocol: [0; INFO_SLOTS],
        }
    }
}

/// Endpoint slots are indexed `ep_num * 2 + direction` (0 = OUT, 1 = IN),
/// matching the peer-side layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EpInfo {
    pub ep_type: [u8; INFO_SLOTS],
    pub interval: [u8; INFO_SLOTS],
    pub interface: [u8; INFO_SLOTS],
    /// Only on the wire when [`Capability::EpInfoMaxPacketSize`] is
    /// negotiated.
    pub max_packet_size: [u16; INFO_SLOTS],
}

impl Default for EpInfo {
    fn default() -> Self {
        Self {
            ep_type: [u8::MAX; INFO_SLOTS],
            interval: [0; INFO_SLOTS],
            interface: [0; INFO_SLOTS],
            max_packet_size: [0; INFO_SLOTS],
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ControlPacket {
    pub endpoint: u8,
    pub request: u8,
    pub requesttype: u8,
    pub status: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BulkPacket {
    pub endpoint: u8,
    pub status: u8,
    /// Full 32-bit length; the high half only travels on the wire when
    /// [`Capability::BulkLength32Bit`] is negotiated.
    pub length: u32,
    pub stream_id: u32,
}

/// One decoded protocol message, with its payload for data-bearing packets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Hello(Hello),
    DeviceConnect(DeviceConnect),
    DeviceDisconnect,
    Reset,
    InterfaceInfo(InterfaceInfo),
    EpInfo(EpInfo),
    SetConfiguration { configuration: u8 },
    GetConfiguration,
    ConfigurationStatus { status: u8, configuration: u8 },
    SetAltSetting { interface: u8, alt: u8 },
    GetAltSetting { interface: u8 },
    AltSettingStatus { status: u8, interface: u8, alt: u8 },
    CancelDataPacket,
    ControlPacket { hdr: ControlPacket, data: Vec<u8> },
    BulkPacket { hdr: BulkPacket, data: Vec<u8> },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::DeviceConnect(_) => MessageType::DeviceConnect,
            Message::DeviceDisconnect => MessageType::DeviceDisconnect,
            Message::Reset => MessageType::Reset,
            Message::InterfaceInfo(_) => MessageType::InterfaceInfo,
            Message::EpInfo(_) => MessageType::EpInfo,
            Message::SetConfiguration { .. } => MessageType::SetConfiguration,
            Message::GetConfiguration => MessageType::GetConfiguration,
            Message::ConfigurationStatus { .. } => {
                MessageType::ConfigurationStatus
            }
            Message::SetAltSetting { .. } => MessageType::SetAltSetting,
            Message::GetAltSetting { .. } => MessageType::GetAltSetting,
            Message::AltSettingStatus { .. } => MessageType::AltSettingStatus,
            Message::CancelDataPacket => MessageType::CancelDataPacket,
            Message::ControlPacket { .. } => MessageType::ControlPacket,
            Message::BulkPacket { .. } => MessageType::BulkPacket,
        }
    }
}

/// Decode-side failures. The session that produced one of these is no longer
/// trustworthy; the embedder is expected to poison it rather than resync.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownType(u32),

    #[error("{mtype:?} body of {len} bytes exceeds limit")]
    BodyTooLarge { mtype: MessageType, len: usize },

    #[error("{mtype:?} body of {len} bytes is malformed")]
    BadBody { mtype: MessageType, len: usize },

    #[error("expected hello, peer sent {0:?} first")]
    HelloExpected(MessageType),

    #[error("hello version string is not NUL-terminated")]
    BadVersion,
}
