// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Mutex;

pub trait IntrPin: Send + Sync + 'static {
    fn assert(&self);
    fn deassert(&self);
    fn is_asserted(&self) -> bool;
    fn pulse(&self) {
        if !self.is_asserted() {
            self.assert();
            self.deassert();
        }
    }
    fn set_state(&self, is_asserted: bool) {
        if is_asserted {
            self.assert();
        } else {
            self.deassert();
        }
    }
}

/// Level-tracking pin with no wiring behind it. Useful as a stand-in where
/// the embedder has not connected an interrupt line, and in tests.
#[derive(Default)]
pub struct NoOpPin {
    asserted: Mutex<bool>,
}

impl IntrPin for NoOpPin {
    fn assert(&self) {
        let mut asserted = self.asserted.lock().unwrap();
        *asserted = true;
    }
    fn deassert(&self) {
        let mut asserted = self.asserted.lock().unwrap();
        *asserted = false;
    }
    fn is_asserted(&self) -> bool {
        let asserted = self.asserted.lock().unwrap();
        *asserted
    }
}
