// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Emulated USB device-mode controller (UDC).
//!
//! The controller exposes a ChipIdea-style register window to the guest and
//! moves transfer payloads between guest-resident descriptor chains and a
//! [`RedirectHost`] session. The guest side drives it through ENDPTPRIME;
//! the peer side arrives through [`RedirectTarget`] callbacks.

use std::sync::{Arc, Mutex};

use slog::{o, Logger};
use usbredir_proto::ControlPacket;

use crate::common::{RWOp, ReadOp, WriteOp};
use crate::hw::usb::redirect::{RedirectHost, RedirectTarget};
use crate::intr_pins::IntrPin;
use crate::mem::GuestMemory;

pub mod bits;
pub mod queue;
pub mod registers;

use bits::*;
use queue::{rx_index, tx_index, ChainCursor, QueueView};
use registers::{Registers, UDC_REGS};

#[usdt::provider(provider = "udc")]
mod probes {
    fn udc_reset() {}
    fn udc_reg_read(reg: String, value: u32) {}
    fn udc_reg_write(reg: String, value: u32) {}
    fn udc_prime(value: u32) {}
    fn udc_send(ep: u8, len: u32) {}
    fn udc_recv(ep: u8, len: u32) {}
}

struct UdcState {
    command: UsbCommand,
    status: UsbStatus,
    intr_enable: u32,
    endpoint_list_address: u32,
    portsc1: PortStatusControl,
    usb_mode: UsbMode,
    endpoint_setup_status: u32,
    endpoint_prime: u32,
    endpoint_status: u32,
    endpoint_complete: u32,
    endpoint_control: [EndpointControl; NUM_ENDPOINTS as usize],
    running: bool,
    attached: bool,
    rx_cursors: [ChainCursor; NUM_ENDPOINTS as usize],
}

impl UdcState {
    fn new() -> Self {
        Self {
            command: UsbCommand(USBCMD_INIT),
            status: UsbStatus(0),
            intr_enable: 0,
            endpoint_list_address: 0,
            portsc1: PortStatusControl(PORTSC1_INIT),
            usb_mode: UsbMode(USBMODE_INIT),
            endpoint_setup_status: 0,
            endpoint_prime: 0,
            endpoint_status: 0,
            endpoint_complete: 0,
            endpoint_control: [
                EndpointControl(ENDPTCTRL0_INIT),
                EndpointControl(0),
                EndpointControl(0),
            ],
            running: false,
            attached: false,
            rx_cursors: [ChainCursor::default(); NUM_ENDPOINTS as usize],
        }
    }

    /// Controller reset: registers return to their initial values with the
    /// reset bit self-clearing. Attachment state belongs to the peer session
    /// and survives.
    fn reset(&mut self) {
        probes::udc_reset!(|| ());
        let attached = self.attached;
        *self = Self::new();
        self.command.set_controller_reset(false);
        self.attached = attached;
    }
}

pub struct Udc {
    state: Mutex<UdcState>,
    mem: Arc<dyn GuestMemory>,
    pin: Arc<dyn IntrPin>,
    bridge: Arc<RedirectHost>,
    log: Logger,
}

impl Udc {
    pub fn create(
        mem: Arc<dyn GuestMemory>,
        pin: Arc<dyn IntrPin>,
        bridge: Arc<RedirectHost>,
        log: Logger,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            state: Mutex::new(UdcState::new()),
            mem,
            pin,
            bridge,
            log: log.new(o!("component" => "udc")),
        });
        this.bridge.set_target(Arc::downgrade(
            &(this.clone() as Arc<dyn RedirectTarget>),
        ));
        this
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.reset();
        self.update_irq(&state);
    }

    /// Handle a guest access to the register window. The hardware only
    /// supports aligned 4-byte accesses; anything else reads as zero and
    /// writes are dropped.
    pub fn mmio_rw(&self, rwo: &mut RWOp) {
        if rwo.offset() + rwo.len() > REGISTER_WINDOW_SZ
            || rwo.len() != 4
            || rwo.offset() % 4 != 0
        {
            slog::warn!(self.log, "unsupported register access";
                "offset" => rwo.offset(), "len" => rwo.len());
            if let RWOp::Read(ro) = rwo {
                ro.fill(0);
            }
            return;
        }
        UDC_REGS.process(rwo, |id, rwo| match rwo {
            RWOp::Read(ro) => self.reg_read(*id, ro),
            RWOp::Write(wo) => self.reg_write(*id, wo),
        });
    }

    fn reg_read(&self, id: Registers, ro: &mut ReadOp) {
        let state = self.state.lock().unwrap();
        let value = match id {
            Registers::Reserved => {
                slog::warn!(self.log, "read of unsupported register";
                    "offset" => ro.offset());
                0
            }
            Registers::DccParams => DCCPARAMS_VALUE.0,
            Registers::UsbCommand => state.command.0,
            Registers::UsbStatus => state.status.0,
            Registers::IntrEnable => state.intr_enable,
            Registers::EndpointListAddr => state.endpoint_list_address,
            Registers::PortControlStatus1 => state.portsc1.0,
            Registers::UsbMode => state.usb_mode.0,
            Registers::EndptSetupStat => state.endpoint_setup_status,
            Registers::EndptPrime => state.endpoint_prime,
            // Nothing is ever buffered, so a flush always appears done.
            Registers::EndptFlush => 0,
            Registers::EndptStat => state.endpoint_status,
            Registers::EndptComplete => state.endpoint_complete,
            Registers::EndptCtrl(n) => {
                state.endpoint_control[n as usize].0
            }
        };
        probes::udc_reg_read!(|| (id.reg_name().to_string(), value));
        ro.write_u32(value);
    }

    fn reg_write(&self, id: Registers, wo: &mut WriteOp) {
        let value = wo.read_u32();
        probes::udc_reg_write!(|| (id.reg_name().to_string(), value));
        match id {
            Registers::Reserved => {
                slog::warn!(self.log, "write to unsupported register";
                    "offset" => wo.offset(), "value" => value);
            }
            Registers::DccParams | Registers::EndptStat => {
                slog::warn!(self.log, "write to read-only register";
                    "register" => id.reg_name(), "value" => value);
            }
            Registers::UsbCommand => self.write_usbcmd(value),
            Registers::UsbStatus => self.write_usbsts(value),
            Registers::IntrEnable => {
                let mut state = self.state.lock().unwrap();
                state.intr_enable = value;
                self.update_irq(&state);
            }
            Registers::EndpointListAddr => {
                self.state.lock().unwrap().endpoint_list_address = value;
            }
            Registers::PortControlStatus1 => {
                let mut state = self.state.lock().unwrap();
                state.portsc1.0 = (value & !PORTSC1_RO_MASK)
                    | (state.portsc1.0 & PORTSC1_RO_MASK);
            }
            Registers::UsbMode => {
                self.state.lock().unwrap().usb_mode.0 = value;
            }
            Registers::EndptSetupStat => {
                self.state.lock().unwrap().endpoint_setup_status &= !value;
            }
            Registers::EndptPrime => self.write_endptprime(value),
            Registers::EndptFlush => {
                // No buffers to flush; just retire the status bits.
                self.state.lock().unwrap().endpoint_status &= !value;
            }
            Registers::EndptComplete => {
                self.state.lock().unwrap().endpoint_complete &= !value;
            }
            Registers::EndptCtrl(0) => {
                let mut state = self.state.lock().unwrap();
                let ctrl0 = &mut state.endpoint_control[0];
                ctrl0.0 = (value & !ENDPTCTRL0_RO_MASK)
                    | (ctrl0.0 & ENDPTCTRL0_RO_MASK);
            }
            Registers::EndptCtrl(n) => {
                self.state.lock().unwrap().endpoint_control[n as usize].0 =
                    value;
            }
        }
    }

    fn write_usbcmd(&self, value: u32) {
        let mut state = self.state.lock().unwrap();
        state.command = UsbCommand(value);

        if state.command.controller_reset() {
            state.reset();
        }

        let run = state.command.run_stop();
        if state.running != run {
            state.running = run;
            if run && state.attached {
                state.portsc1.set_current_connect_status(true);
                state.status.set_port_change_detect(true);
            }
        }
        // A reset clears `running` without toggling the RUN bit, so the
        // line must be recomputed whether or not the run state changed.
        self.update_irq(&state);
    }

    fn write_usbsts(&self, value: u32) {
        let mut state = self.state.lock().unwrap();
        let value = value & !USBSTS_RO_MASK;

        state.status.0 &= !value;
        state.status.set_dcsuspend(UsbStatus(value).dcsuspend());

        // Attachment is complete once the guest acknowledges the port
        // change; solicit the device configuration in response.
        if state.running
            && state.attached
            && UsbStatus(value).port_change_detect()
        {
            self.bridge.attach_complete();
        }

        self.update_irq(&state);
    }

    fn write_endptprime(&self, value: u32) {
        let rx_primed = {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                slog::warn!(self.log,
                    "endpoint primed while device not running");
                return;
            }
            if !state.attached {
                slog::warn!(self.log,
                    "endpoint primed while device not attached");
                return;
            }
            probes::udc_prime!(|| (value));
            state.endpoint_prime = value;

            // Publish the new buffer state before touching the peer: a
            // session callback may arrive underneath and consume it.
            state.endpoint_status |= value & ENDPT_RX_MASK;
            state.endpoint_complete |= value & ENDPT_TX_MASK;

            let tx_primed = EndpointBits(value).tx();
            for ep in 0..NUM_ENDPOINTS {
                if tx_primed & (1 << ep) != 0 {
                    self.send_data(&mut state, ep);
                }
            }

            state.status.set_usb_interrupt(true);
            self.update_irq(&state);
            EndpointBits(value).rx()
        };

        // RX primes tell the session the guest can take the next inbound
        // payload; delivery re-enters through on_data_out, so the state
        // lock must be free here.
        for ep in 0..NUM_ENDPOINTS {
            if rx_primed & (1 << ep) != 0 {
                self.bridge.data_out_complete(ep);
            }
        }
    }

    /// Transmit the descriptor chain off the endpoint's TX queue head, one
    /// bounded walk per prime. Endpoint 0 data answers the outstanding
    /// control request; other endpoints carry bulk data.
    fn send_data(&self, state: &mut UdcState, ep: u8) {
        let view =
            QueueView::new(self.mem.as_ref(), state.endpoint_list_address);
        let res = (|| -> queue::Result<()> {
            let qh = view.queue_head(tx_index(ep))?;
            for entry in view.walk(qh.td.next_pointer) {
                let (td_addr, td) = entry?;
                let data =
                    view.read_payload(&td, td.total_bytes() as usize)?;
                probes::udc_send!(|| (ep, data.len() as u32));

                let sent = if ep == CONTROL_EP {
                    self.bridge.control_transfer_complete(&data)
                } else {
                    self.bridge.data_in_complete(ep, &data)
                };

                if sent == data.len() {
                    view.write_td_info(
                        td_addr,
                        td_info::INTERRUPT_ON_COMPLETE,
                    )?;
                } else {
                    slog::warn!(self.log,
                        "session did not take transmit data";
                        "ep" => ep, "len" => data.len(), "sent" => sent);
                }
            }
            Ok(())
        })();
        if let Err(e) = res {
            slog::error!(self.log, "transmit failed";
                "ep" => ep, "error" => %e);
        }
    }

    /// Land an inbound payload in the endpoint's RX descriptor chain and
    /// raise completion. Consecutive deliveries walk the chain through the
    /// endpoint's cursor.
    fn write_data(&self, ep: u8, data: &[u8]) {
        if ep >= NUM_ENDPOINTS {
            slog::warn!(self.log, "inbound data for nonexistent endpoint";
                "ep" => ep);
            return;
        }
        let mut state = self.state.lock().unwrap();
        let view =
            QueueView::new(self.mem.as_ref(), state.endpoint_list_address);
        let res = (|| -> queue::Result<()> {
            let qh = view.queue_head(rx_index(ep))?;
            let head = qh.td.next_pointer;
            let (td_addr, td) =
                state.rx_cursors[ep as usize].step(&view, head)?;

            let request_len = td.total_bytes();
            let len = (data.len() as u32).min(request_len);
            if (data.len() as u32) > request_len {
                slog::warn!(self.log, "inbound data exceeds buffer";
                    "ep" => ep, "len" => data.len(),
                    "request_len" => request_len);
            }
            probes::udc_recv!(|| (ep, len));

            let info = ((request_len - len) << td_info::TOTAL_BYTES_SHIFT)
                | td_info::INTERRUPT_ON_COMPLETE;
            view.write_td_info(td_addr, info)?;
            view.write_payload(&td, &data[..len as usize])?;
            Ok(())
        })();

        match res {
            Ok(()) => {
                state.endpoint_complete |= 1 << ep;
                state.endpoint_status &= !ENDPT_RX_MASK;
                state.status.set_usb_interrupt(true);
                self.update_irq(&state);
            }
            Err(e) => {
                slog::error!(self.log, "inbound delivery failed";
                    "ep" => ep, "error" => %e);
            }
        }
    }

    /// Surface a peer control request as a SETUP stage in the control
    /// endpoint's queue head.
    fn inject_setup(&self, ctrl: &ControlPacket) {
        let mut state = self.state.lock().unwrap();
        let view =
            QueueView::new(self.mem.as_ref(), state.endpoint_list_address);
        let setup = [
            ctrl.requesttype as u32
                | (ctrl.request as u32) << 8
                | (ctrl.value as u32) << 16,
            ctrl.index as u32 | (ctrl.length as u32) << 16,
        ];
        match view.write_setup(setup) {
            Ok(()) => {
                state.endpoint_setup_status |= 1 << CONTROL_EP;
                state.status.set_usb_interrupt(true);
                self.update_irq(&state);
            }
            Err(e) => {
                slog::error!(self.log, "setup injection failed";
                    "error" => %e);
            }
        }
    }

    fn update_irq(&self, state: &UdcState) {
        let level =
            state.running && (state.intr_enable & state.status.0) != 0;
        self.pin.set_state(level);
    }
}

impl RedirectTarget for Udc {
    fn on_attach(&self) -> u8 {
        let mut state = self.state.lock().unwrap();
        state.attached = true;
        if state.running {
            state.portsc1.set_current_connect_status(true);
            state.status.set_port_change_detect(true);
        }
        self.update_irq(&state);
        CONTROL_EP
    }

    fn on_detach(&self) {
        let mut state = self.state.lock().unwrap();
        state.attached = false;
        if state.running {
            state.portsc1 = PortStatusControl(PORTSC1_INIT);
            state.status.set_port_change_detect(true);
        }
        self.update_irq(&state);
    }

    fn on_reset(&self) {
        // Resetting out from under an attached guest is undefined, so the
        // request is dropped on the floor.
        if self.state.lock().unwrap().attached {
            slog::warn!(self.log,
                "ignoring peer reset request while attached");
            return;
        }
        self.reset();
    }

    fn on_control_transfer(&self, ctrl: ControlPacket) {
        self.inject_setup(&ctrl);
    }

    fn on_data_out(&self, ep: u8, data: &[u8]) {
        self.write_data(ep, data);
    }
}
