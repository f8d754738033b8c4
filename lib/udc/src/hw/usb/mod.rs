// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*!
## Emulated USB 2.0 device-mode controller (UDC) with usbredir redirection.

The controller models the register file and descriptor queues of a
ChipIdea-style device controller, the kind a SoC exposes to its firmware
rather than a host-side HC. The guest drives it over a 4 KiB MMIO window;
USB traffic does not terminate in an emulated device but is carried over
the usbredir wire protocol to a remote peer, which sees the guest as an
attachable USB device.

```text
  +-----------+  MMIO r/w   +-----+   queue heads / TDs   +-------------+
  |   guest   | <---------> | Udc | <-------------------> | guest memory |
  +-----------+             +--+--+                       +-------------+
                               | RedirectTarget / bridge calls
                        +------+-------+
                        | RedirectHost |
                        +------+-------+
                               | framed usbredir messages
                        +------+------+
                        |  Transport  |  (socket, chardev, ...)
                        +-------------+
```

[Udc]: udc::Udc
[RedirectHost]: redirect::RedirectHost
*/

pub mod redirect;
pub mod udc;
