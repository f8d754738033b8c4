// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Emulated USB 2.0 device-mode controller with usbredir-based redirection.
//!
//! The crate provides the device model itself ([hw::usb::udc]), the bridge
//! that connects it to a remote usbredir peer ([hw::usb::redirect]), and the
//! small set of interfaces an embedder supplies: guest memory access
//! ([mem::GuestMemory]), an interrupt line ([intr_pins::IntrPin]), and a
//! byte transport ([chardev::Transport]).

pub extern crate usdt;
#[macro_use]
extern crate bitflags;

pub mod chardev;
pub mod common;
pub mod hw;
pub mod intr_pins;
pub mod mem;
pub mod util;
