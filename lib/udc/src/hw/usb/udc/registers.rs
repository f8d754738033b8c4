// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UDC register window layout.

use crate::util::regmap::RegMap;

use super::bits;

use lazy_static::lazy_static;

/// Registers in the 4 KiB MMIO window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Registers {
    Reserved,

    /// Device Controller Capability Parameters (DCCPARAMS), read-only.
    DccParams,

    /// USB Command Register (USBCMD).
    UsbCommand,

    /// USB Status Register (USBSTS), write-1-to-clear.
    UsbStatus,

    /// USB Interrupt Enable Register (USBINTR).
    IntrEnable,

    /// Device Controller Endpoint List Address (ENDPOINTLISTADDR).
    EndpointListAddr,

    /// Port Status/Control 1 (PORTSC1).
    PortControlStatus1,

    /// USB Device Mode Register (USBMODE).
    UsbMode,

    /// Endpoint Setup Status (ENDPTSETUPSTAT), write-1-to-clear.
    EndptSetupStat,

    /// Endpoint Initialization (ENDPTPRIME); writing kicks off transfers.
    EndptPrime,

    /// Endpoint De-Initialization (ENDPTFLUSH); reads as 0.
    EndptFlush,

    /// Endpoint Status (ENDPTSTAT), read-only.
    EndptStat,

    /// Endpoint Complete (ENDPTCOMPLETE), write-1-to-clear.
    EndptComplete,

    /// Endpoint Control 0..2 (ENDPTCTRL0..2).
    EndptCtrl(u8),
}

lazy_static! {
    pub static ref UDC_REGS: RegMap<Registers> = {
        use Registers::*;

        let layout = [
            (Reserved, 0x124),
            (DccParams, 4),
            (Reserved, 0x18),
            (UsbCommand, 4),
            (UsbStatus, 4),
            (IntrEnable, 4),
            (Reserved, 0xc),
            (EndpointListAddr, 4),
            (Reserved, 0x28),
            (PortControlStatus1, 4),
            (Reserved, 0x20),
            (UsbMode, 4),
            (EndptSetupStat, 4),
            (EndptPrime, 4),
            (EndptFlush, 4),
            (EndptStat, 4),
            (EndptComplete, 4),
            (EndptCtrl(0), 4),
            (EndptCtrl(1), 4),
            (EndptCtrl(2), 4),
            (Reserved, 0xe34),
        ];

        RegMap::create_packed(
            bits::REGISTER_WINDOW_SZ,
            &layout,
            Some(Reserved),
        )
    };
}

impl Registers {
    /// Returns the register's name as the datasheet abbreviates it.
    pub const fn reg_name(&self) -> &'static str {
        use Registers::*;
        match self {
            Reserved => "Rsvd.",
            DccParams => "DCCPARAMS",
            UsbCommand => "USBCMD",
            UsbStatus => "USBSTS",
            IntrEnable => "USBINTR",
            EndpointListAddr => "ENDPOINTLISTADDR",
            PortControlStatus1 => "PORTSC1",
            UsbMode => "USBMODE",
            EndptSetupStat => "ENDPTSETUPSTAT",
            EndptPrime => "ENDPTPRIME",
            EndptFlush => "ENDPTFLUSH",
            EndptStat => "ENDPTSTAT",
            EndptComplete => "ENDPTCOMPLETE",
            EndptCtrl(0) => "ENDPTCTRL0",
            EndptCtrl(1) => "ENDPTCTRL1",
            EndptCtrl(_) => "ENDPTCTRL2",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::{RWOp, ReadOp};

    fn reg_at(offset: usize) -> Registers {
        let mut buf = [0u8; 4];
        let mut ro = ReadOp::from_buf(offset, &mut buf);
        let mut hit = Registers::Reserved;
        UDC_REGS.process(&mut RWOp::Read(&mut ro), |id, _| hit = *id);
        hit
    }

    #[test]
    fn documented_offsets() {
        assert_eq!(reg_at(0x124), Registers::DccParams);
        assert_eq!(reg_at(0x140), Registers::UsbCommand);
        assert_eq!(reg_at(0x144), Registers::UsbStatus);
        assert_eq!(reg_at(0x148), Registers::IntrEnable);
        assert_eq!(reg_at(0x158), Registers::EndpointListAddr);
        assert_eq!(reg_at(0x184), Registers::PortControlStatus1);
        assert_eq!(reg_at(0x1a8), Registers::UsbMode);
        assert_eq!(reg_at(0x1ac), Registers::EndptSetupStat);
        assert_eq!(reg_at(0x1b0), Registers::EndptPrime);
        assert_eq!(reg_at(0x1b4), Registers::EndptFlush);
        assert_eq!(reg_at(0x1b8), Registers::EndptStat);
        assert_eq!(reg_at(0x1bc), Registers::EndptComplete);
        assert_eq!(reg_at(0x1c0), Registers::EndptCtrl(0));
        assert_eq!(reg_at(0x1c4), Registers::EndptCtrl(1));
        assert_eq!(reg_at(0x1c8), Registers::EndptCtrl(2));
        assert_eq!(reg_at(0x000), Registers::Reserved);
        assert_eq!(reg_at(0xffc), Registers::Reserved);
    }
}
