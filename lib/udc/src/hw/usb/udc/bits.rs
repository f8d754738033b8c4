// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register fields and guest-resident structures for the UDC.

use bitstruct::bitstruct;
use strum::FromRepr;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Size of the MMIO register window.
pub const REGISTER_WINDOW_SZ: usize = 0x1000;

/// Endpoints implemented by the controller; endpoint 0 is the control pipe.
pub const NUM_ENDPOINTS: u8 = 3;
pub const CONTROL_EP: u8 = 0;

pub const USBCMD_INIT: u32 = 0x0008_0002;
pub const PORTSC1_INIT: u32 = 0x0900_0204;
pub const USBMODE_INIT: u32 = 0x0001_5002;
pub const ENDPTCTRL0_INIT: u32 = 0x0080_0080;

bitstruct! {
    /// Device Controller Capability Parameters (DCCPARAMS), read-only.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct DccParams(pub u32) {
        pub device_endpoint_number: u8 = 0..5;
        reserved0: u8 = 5..7;
        pub device_capable: bool = 7;
        pub host_capable: bool = 8;
        reserved1: u32 = 9..32;
    }
}

/// Fixed DCCPARAMS value: device-capable, three endpoints.
pub const DCCPARAMS_VALUE: DccParams = DccParams(0)
    .with_device_endpoint_number(NUM_ENDPOINTS)
    .with_device_capable(true);

bitstruct! {
    /// USB Command Register (USBCMD).
    #[derive(Clone, Copy, Debug, Default)]
    pub struct UsbCommand(pub u32) {
        pub run_stop: bool = 0;
        pub controller_reset: bool = 1;
        reserved0: u16 = 2..13;
        pub setup_tripwire: bool = 13;
        pub add_dtd_tripwire: bool = 14;
        reserved1: bool = 15;
        pub interrupt_threshold: u8 = 16..24;
        reserved2: u8 = 24..32;
    }
}

bitstruct! {
    /// USB Status Register (USBSTS). USBINTR shares this bit layout, so the
    /// same structure models the interrupt-enable register.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct UsbStatus(pub u32) {
        pub usb_interrupt: bool = 0;
        pub usb_error_interrupt: bool = 1;
        pub port_change_detect: bool = 2;
        reserved0: bool = 3;
        pub system_error: bool = 4;
        reserved1: bool = 5;
        pub usb_reset_received: bool = 6;
        pub sof_received: bool = 7;
        pub dcsuspend: bool = 8;
        reserved2: u8 = 9..16;
        pub nak_interrupt: bool = 16;
        reserved3: u8 = 17..24;
        pub timer_interrupt_0: bool = 24;
        pub timer_interrupt_1: bool = 25;
        reserved4: u8 = 26..32;
    }
}

/// USBSTS bits the guest cannot write (set by the model only).
pub const USBSTS_RO_MASK: u32 =
    UsbStatus(0).with_system_error(true).with_nak_interrupt(true).0;

bitstruct! {
    /// Port Status/Control 1 Register (PORTSC1).
    #[derive(Clone, Copy, Debug, Default)]
    pub struct PortStatusControl(pub u32) {
        pub current_connect_status: bool = 0;
        reserved0: bool = 1;
        pub port_enable: bool = 2;
        reserved1: u8 = 3..6;
        pub force_port_resume: bool = 6;
        pub suspend: bool = 7;
        pub port_reset: bool = 8;
        pub high_speed_port: bool = 9;
        pub line_status: u8 = 10..12;
        reserved2: u8 = 12..16;
        pub port_test_control: u8 = 16..20;
        reserved3: u8 = 20..23;
        pub phy_low_power_suspend: bool = 23;
        pub port_force_full_speed_connect: bool = 24;
        reserved4: bool = 25;
        pub port_speed: u8 = 26..28;
        reserved5: bool = 28;
        pub serial_transceiver_select: bool = 29;
        pub parallel_transceiver_select: u8 = 30..32;
    }
}

/// PORTSC1 bits owned by the controller; guest writes leave them intact.
pub const PORTSC1_RO_MASK: u32 = PortStatusControl(0)
    .with_current_connect_status(true)
    .with_suspend(true)
    .with_port_reset(true)
    .with_high_speed_port(true)
    .with_line_status(0b11)
    .with_port_speed(0b11)
    .with_serial_transceiver_select(true)
    .0;

bitstruct! {
    /// USB Device Mode Register (USBMODE).
    #[derive(Clone, Copy, Debug, Default)]
    pub struct UsbMode(pub u32) {
        reserved0: u8 = 0..2;
        pub endian_select: bool = 2;
        pub setup_lockout_mode: bool = 3;
        pub stream_disable_mode: bool = 4;
        reserved1: u32 = 5..32;
    }
}

bitstruct! {
    /// Per-endpoint bitmaps shared by ENDPTPRIME, ENDPTFLUSH, ENDPTSTAT,
    /// and ENDPTCOMPLETE: RX buffers in the low half, TX in the high half.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct EndpointBits(pub u32) {
        pub rx: u8 = 0..7;
        reserved0: u16 = 7..16;
        pub tx: u8 = 16..23;
        reserved1: u16 = 23..32;
    }
}

pub const ENDPT_RX_MASK: u32 = EndpointBits(0).with_rx(0x7f).0;
pub const ENDPT_TX_MASK: u32 = EndpointBits(0).with_tx(0x7f).0;

bitstruct! {
    /// Endpoint Control Registers (ENDPTCTRL0..2).
    #[derive(Clone, Copy, Debug, Default)]
    pub struct EndpointControl(pub u32) {
        pub rx_stall: bool = 0;
        pub rx_data_sink: bool = 1;
        pub rx_type: u8 = 2..4;
        reserved0: bool = 4;
        pub rx_toggle_inhibit: bool = 5;
        pub rx_toggle_reset: bool = 6;
        pub rx_enable: bool = 7;
        reserved1: u8 = 8..16;
        pub tx_stall: bool = 16;
        pub tx_data_source: bool = 17;
        pub tx_type: u8 = 18..20;
        reserved2: bool = 20;
        pub tx_toggle_inhibit: bool = 21;
        pub tx_toggle_reset: bool = 22;
        pub tx_enable: bool = 23;
        reserved3: u8 = 24..32;
    }
}

/// ENDPTCTRL0 enable bits are hardwired for the control endpoint.
pub const ENDPTCTRL0_RO_MASK: u32 =
    EndpointControl(0).with_rx_enable(true).with_tx_enable(true).0;

/// Endpoint transfer types as encoded in ENDPTCTRL RX/TX_TYPE fields.
#[repr(u8)]
#[derive(FromRepr, Copy, Clone, Debug, Eq, PartialEq)]
pub enum EpTransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

pub mod td_info {
    //! Field masks for [`TransferDescriptor::info`].
    //!
    //! [`TransferDescriptor::info`]: super::TransferDescriptor::info

    pub const STATUS_MASK: u32 = 0xf;
    pub const INTERRUPT_ON_COMPLETE: u32 = 0x8000;
    pub const TOTAL_BYTES_SHIFT: u32 = 16;
    pub const TOTAL_BYTES_MASK: u32 = 0x7fff_0000;
}

/// Descriptor-chain terminator: a next pointer with bit 0 set ends the chain.
pub const TD_NEXT_POINTER_TERMINATE: u32 = 1;

/// A transfer descriptor as laid out in guest memory.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable)]
pub struct TransferDescriptor {
    pub next_pointer: u32,
    pub info: u32,
    pub buffer_pointers: [u32; 5],
}

impl TransferDescriptor {
    pub fn total_bytes(&self) -> u32 {
        (self.info & td_info::TOTAL_BYTES_MASK) >> td_info::TOTAL_BYTES_SHIFT
    }
    pub fn set_total_bytes(&mut self, bytes: u32) {
        self.info = (self.info & !td_info::TOTAL_BYTES_MASK)
            | ((bytes << td_info::TOTAL_BYTES_SHIFT)
                & td_info::TOTAL_BYTES_MASK);
    }
    pub fn interrupt_on_complete(&self) -> bool {
        self.info & td_info::INTERRUPT_ON_COMPLETE != 0
    }
    pub fn status(&self) -> u32 {
        self.info & td_info::STATUS_MASK
    }
    pub fn terminates_chain(&self) -> bool {
        self.next_pointer & TD_NEXT_POINTER_TERMINATE != 0
    }
}

pub mod qh_ep_info {
    //! Field masks for [`QueueHead::endpoint_info`].
    //!
    //! [`QueueHead::endpoint_info`]: super::QueueHead::endpoint_info

    pub const INTERRUPT_ON_SETUP: u32 = 0x8000;
    pub const MAX_PACKET_LENGTH_SHIFT: u32 = 16;
    pub const MAX_PACKET_LENGTH_MASK: u32 = 0x3ff_0000;
}

/// A queue head as laid out in guest memory: one per endpoint direction,
/// with the RX head for endpoint `n` at index `2n` and TX at `2n + 1`
/// relative to ENDPOINTLISTADDR.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable)]
pub struct QueueHead {
    pub endpoint_info: u32,
    pub current_pointer: u32,
    pub td: TransferDescriptor,
    pub reserved: u32,
    pub setup: [u32; 2],
    pub padding: [u32; 4],
}

/// Byte offset of the SETUP stage words within a queue head.
pub const QH_SETUP_OFFSET: usize = 40;

impl QueueHead {
    pub fn max_packet_length(&self) -> u32 {
        (self.endpoint_info & qh_ep_info::MAX_PACKET_LENGTH_MASK)
            >> qh_ep_info::MAX_PACKET_LENGTH_SHIFT
    }
}
