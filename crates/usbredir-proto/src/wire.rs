// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Frame-level encode/decode.
//!
//! A frame is `type: u32, length: u32, id: u32` followed by `length` body
//! bytes. Once both sides of a session have negotiated
//! [`Capability::Ids64Bit`], the id field widens to a `u64`. The id is
//! meaningful for data-bearing packets and cancellation; other messages
//! carry 0.

use byteorder::{ByteOrder, LE};

use crate::*;

const NARROW_HEADER_LEN: usize = 12;
const WIDE_HEADER_LEN: usize = 16;

const CONTROL_HDR_LEN: usize = 10;
const INTERFACE_INFO_LEN: usize = 4 + 4 * INFO_SLOTS;
const EP_INFO_BASE_LEN: usize = 3 * INFO_SLOTS;
const EP_INFO_MPS_LEN: usize = EP_INFO_BASE_LEN + 2 * INFO_SLOTS;

/// Serializes messages into framed bytes.
pub struct Encoder {
    negotiated: Option<Caps>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { negotiated: None }
    }

    /// Record the capability set in effect for the rest of the session.
    /// Must be called once the peer's hello has been seen; frames encoded
    /// before that use the pre-negotiation layouts.
    pub fn set_negotiated(&mut self, caps: Caps) {
        self.negotiated = Some(caps);
    }

    fn has(&self, cap: Capability) -> bool {
        self.negotiated.map_or(false, |c| c.has(cap))
    }

    pub fn encode(&self, id: u64, msg: &Message) -> Vec<u8> {
        let body = self.encode_body(msg);
        let wide = self.has(Capability::Ids64Bit);
        let hdr_len =
            if wide { WIDE_HEADER_LEN } else { NARROW_HEADER_LEN };

        let mut out = vec![0u8; hdr_len + body.len()];
        LE::write_u32(&mut out[0..4], msg.message_type() as u32);
        LE::write_u32(&mut out[4..8], body.len() as u32);
        if wide {
            LE::write_u64(&mut out[8..16], id);
        } else {
            LE::write_u32(&mut out[8..12], id as u32);
        }
        out[hdr_len..].copy_from_slice(&body);
        out
    }

    fn encode_body(&self, msg: &Message) -> Vec<u8> {
        match msg {
            Message::Hello(hello) => {
                let mut body =
                    vec![0u8; HELLO_VERSION_LEN + 4 * CAPS_WORDS];
                let vlen =
                    hello.version.len().min(HELLO_VERSION_LEN - 1);
                body[..vlen]
                    .copy_from_slice(&hello.version.as_bytes()[..vlen]);
                for (i, word) in hello.caps.words().iter().enumerate() {
                    LE::write_u32(
                        &mut body[HELLO_VERSION_LEN + i * 4..][..4],
                        *word,
                    );
                }
                body
            }
            Message::DeviceConnect(dc) => {
                let mut body = vec![
                    dc.speed,
                    dc.device_class,
                    dc.device_subclass,
                    dc.device_protocol,
                    0,
                    0,
                    0,
                    0,
                ];
                LE::write_u16(&mut body[4..6], dc.vendor_id);
                LE::write_u16(&mut body[6..8], dc.product_id);
                if self.has(Capability::ConnectDeviceVersion) {
                    body.extend_from_slice(
                        &dc.device_version_bcd.to_le_bytes(),
                    );
                }
                body
            }
            Message::DeviceDisconnect
            | Message::Reset
            | Message::GetConfiguration
            | Message::CancelDataPacket => Vec::new(),
            Message::InterfaceInfo(info) => {
                let mut body = vec![0u8; INTERFACE_INFO_LEN];
                LE::write_u32(&mut body[0..4], info.interface_count);
                let mut off = 4;
                for arr in [
                    &info.interface,
                    &info.interface_class,
                    &info.interface_subclass,
                    &info.interface_protocol,
                ] {
                    body[off..off + INFO_SLOTS].copy_from_slice(arr);
                    off += INFO_SLOTS;
                }
                body
            }
            Message::EpInfo(info) => {
                let with_mps = self.has(Capability::EpInfoMaxPacketSize);
                let len =
                    if with_mps { EP_INFO_MPS_LEN } else { EP_INFO_BASE_LEN };
                let mut body = vec![0u8; len];
                body[..INFO_SLOTS].copy_from_slice(&info.ep_type);
                body[INFO_SLOTS..2 * INFO_SLOTS]
                    .copy_from_slice(&info.interval);
                body[2 * INFO_SLOTS..3 * INFO_SLOTS]
                    .copy_from_slice(&info.interface);
                if with_mps {
                    for (i, mps) in info.max_packet_size.iter().enumerate() {
                        LE::write_u16(
                            &mut body[EP_INFO_BASE_LEN + i * 2..][..2],
                            *mps,
                        );
                    }
                }
                body
            }
            Message::SetConfiguration { configuration } => {
                vec![*configuration]
            }
            Message::ConfigurationStatus { status, configuration } => {
                vec![*status, *configuration]
            }
            Message::SetAltSetting { interface, alt } => {
                vec![*interface, *alt]
            }
            Message::GetAltSetting { interface } => vec![*interface],
            Message::AltSettingStatus { status, interface, alt } => {
                vec![*status, *interface, *alt]
            }
            Message::ControlPacket { hdr, data } => {
                let mut body = vec![0u8; CONTROL_HDR_LEN + data.len()];
                body[0] = hdr.endpoint;
                body[1] = hdr.request;
                body[2] = hdr.requesttype;
                body[3] = hdr.status;
                LE::write_u16(&mut body[4..6], hdr.value);
                LE::write_u16(&mut body[6..8], hdr.index);
                LE::write_u16(&mut body[8..10], hdr.length);
                body[CONTROL_HDR_LEN..].copy_from_slice(data);
                body
            }
            Message::BulkPacket { hdr, data } => {
                let wide_len = self.has(Capability::BulkLength32Bit);
                let hdr_len = if wide_len { 10 } else { 8 };
                let mut body = vec![0u8; hdr_len + data.len()];
                body[0] = hdr.endpoint;
                body[1] = hdr.status;
                LE::write_u16(&mut body[2..4], hdr.length as u16);
                LE::write_u32(&mut body[4..8], hdr.stream_id);
                if wide_len {
                    LE::write_u16(
                        &mut body[8..10],
                        (hdr.length >> 16) as u16,
                    );
                }
                body[hdr_len..].copy_from_slice(data);
                body
            }
        }
    }
}

/// Incremental frame decoder. Input chunks are buffered; [`Decoder::next`]
/// yields complete messages until the buffer runs dry. One chunk may carry
/// any number of frames, including a trailing partial one.
pub struct Decoder {
    buf: Vec<u8>,
    negotiated: Option<Caps>,
}

impl Decoder {
    pub fn new() -> Self {
        Self { buf: Vec::new(), negotiated: None }
    }

    /// See [`Encoder::set_negotiated`].
    pub fn set_negotiated(&mut self, caps: Caps) {
        self.negotiated = Some(caps);
    }

    fn has(&self, cap: Capability) -> bool {
        self.negotiated.map_or(false, |c| c.has(cap))
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete frame, if the buffer holds one.
    pub fn next(&mut self) -> Result<Option<(u64, Message)>, ProtocolError> {
        let wide = self.has(Capability::Ids64Bit);
        let hdr_len =
            if wide { WIDE_HEADER_LEN } else { NARROW_HEADER_LEN };
        if self.buf.len() < hdr_len {
            return Ok(None);
        }

        let raw_type = LE::read_u32(&self.buf[0..4]);
        let mtype = MessageType::from_repr(raw_type)
            .ok_or(ProtocolError::UnknownType(raw_type))?;
        let body_len = LE::read_u32(&self.buf[4..8]) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(ProtocolError::BodyTooLarge {
                mtype,
                len: body_len,
            });
        }
        if self.buf.len() < hdr_len + body_len {
            return Ok(None);
        }

        let id = if wide {
            LE::read_u64(&self.buf[8..16])
        } else {
            LE::read_u32(&self.buf[8..12]) as u64
        };
        let body: Vec<u8> =
            self.buf.drain(..hdr_len + body_len).skip(hdr_len).collect();
        let msg = self.decode_body(mtype, &body)?;
        Ok(Some((id, msg)))
    }

    fn decode_body(
        &self,
        mtype: MessageType,
        body: &[u8],
    ) -> Result<Message, ProtocolError> {
        let bad =
            || ProtocolError::BadBody { mtype, len: body.len() };

        let msg = match mtype {
            MessageType::Hello => {
                if body.len() < HELLO_VERSION_LEN
                    || (body.len() - HELLO_VERSION_LEN) % 4 != 0
                {
                    return Err(bad());
                }
                let nul = body[..HELLO_VERSION_LEN]
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or(ProtocolError::BadVersion)?;
                let version =
                    String::from_utf8_lossy(&body[..nul]).into_owned();
                let words: Vec<u32> = body[HELLO_VERSION_LEN..]
                    .chunks_exact(4)
                    .map(LE::read_u32)
                    .collect();
                Message::Hello(Hello {
                    version,
                    caps: Caps::from_words(&words),
                })
            }
            MessageType::DeviceConnect => {
                // Sized by what the peer actually sent: the bcd version
                // trails only when the peer carries the matching capability.
                if body.len() != 8 && body.len() != 10 {
                    return Err(bad());
                }
                Message::DeviceConnect(DeviceConnect {
                    speed: body[0],
                    device_class: body[1],
                    device_subclass: body[2],
                    device_protocol: body[3],
                    vendor_id: LE::read_u16(&body[4..6]),
                    product_id: LE::read_u16(&body[6..8]),
                    device_version_bcd: if body.len() == 10 {
                        LE::read_u16(&body[8..10])
                    } else {
                        0
                    },
                })
            }
            MessageType::DeviceDisconnect => {
                if !body.is_empty() {
                    return Err(bad());
                }
                Message::DeviceDisconnect
            }
            MessageType::Reset => {
                if !body.is_empty() {
                    return Err(bad());
                }
                Message::Reset
            }
            MessageType::InterfaceInfo => {
                if body.len() != INTERFACE_INFO_LEN {
                    return Err(bad());
                }
                let mut info = InterfaceInfo {
                    interface_count: LE::read_u32(&body[0..4]),
                    ..Default::default()
                };
                let mut off = 4;
                for arr in [
                    &mut info.interface,
                    &mut info.interface_class,
                    &mut info.interface_subclass,
                    &mut info.interface_protocol,
                ] {
                    arr.copy_from_slice(&body[off..off + INFO_SLOTS]);
                    off += INFO_SLOTS;
                }
                Message::InterfaceInfo(info)
            }
            MessageType::EpInfo => {
                if body.len() != EP_INFO_BASE_LEN
                    && body.len() != EP_INFO_MPS_LEN
                {
                    return Err(bad());
                }
                let mut info = EpInfo::default();
                info.ep_type.copy_from_slice(&body[..INFO_SLOTS]);
                info.interval
                    .copy_from_slice(&body[INFO_SLOTS..2 * INFO_SLOTS]);
                info.interface
                    .copy_from_slice(&body[2 * INFO_SLOTS..3 * INFO_SLOTS]);
                if body.len() == EP_INFO_MPS_LEN {
                    for (i, mps) in
                        info.max_packet_size.iter_mut().enumerate()
                    {
                        *mps = LE::read_u16(
                            &body[EP_INFO_BASE_LEN + i * 2..][..2],
                        );
                    }
                }
                Message::EpInfo(info)
            }
            MessageType::SetConfiguration => {
                if body.len() != 1 {
                    return Err(bad());
                }
                Message::SetConfiguration { configuration: body[0] }
            }
            MessageType::GetConfiguration => {
                if !body.is_empty() {
                    return Err(bad());
                }
                Message::GetConfiguration
            }
            MessageType::ConfigurationStatus => {
                if body.len() != 2 {
                    return Err(bad());
                }
                Message::ConfigurationStatus {
                    status: body[0],
                    configuration: body[1],
                }
            }
            MessageType::SetAltSetting => {
                if body.len() != 2 {
                    return Err(bad());
                }
                Message::SetAltSetting { interface: body[0], alt: body[1] }
            }
            MessageType::GetAltSetting => {
                if body.len() != 1 {
                    return Err(bad());
                }
                Message::GetAltSetting { interface: body[0] }
            }
            MessageType::AltSettingStatus => {
                if body.len() != 3 {
                    return Err(bad());
                }
                Message::AltSettingStatus {
                    status: body[0],
                    interface: body[1],
                    alt: body[2],
                }
            }
            MessageType::CancelDataPacket => {
                if !body.is_empty() {
                    return Err(bad());
                }
                Message::CancelDataPacket
            }
            MessageType::ControlPacket => {
                if body.len() < CONTROL_HDR_LEN {
                    return Err(bad());
                }
                let hdr = ControlPacket {
                    endpoint: body[0],
                    request: body[1],
                    requesttype: body[2],
                    status: body[3],
                    value: LE::read_u16(&body[4..6]),
                    index: LE::read_u16(&body[6..8]),
                    length: LE::read_u16(&body[8..10]),
                };
                Message::ControlPacket {
                    hdr,
                    data: body[CONTROL_HDR_LEN..].to_vec(),
                }
            }
            MessageType::BulkPacket => {
                let wide_len = self.has(Capability::BulkLength32Bit);
                let hdr_len = if wide_len { 10 } else { 8 };
                if body.len() < hdr_len {
                    return Err(bad());
                }
                let mut length = LE::read_u16(&body[2..4]) as u32;
                if wide_len {
                    length |= (LE::read_u16(&body[8..10]) as u32) << 16;
                }
                let hdr = BulkPacket {
                    endpoint: body[0],
                    status: body[1],
                    length,
                    stream_id: LE::read_u32(&body[4..8]),
                };
                Message::BulkPacket { hdr, data: body[hdr_len..].to_vec() }
            }
        };
        Ok(msg)
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
