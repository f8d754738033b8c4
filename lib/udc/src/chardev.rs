// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-stream transport plumbing.
//!
//! The redirection bridge writes encoded frames into a [`Transport`] and the
//! embedder pushes bytes arriving from the peer into the bridge. A transport
//! write is nonblocking and may accept fewer bytes than offered; the bridge
//! queues the remainder and arms the writable notifier to resume.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub type TransportNotifier = Box<dyn Fn(&dyn Transport) + Send + Sync + 'static>;

pub trait Transport: Send + Sync + 'static {
    /// Attempt to write `data`, returning how many bytes were accepted.
    fn write(&self, data: &[u8]) -> usize;

    /// Set notifier callback for when the transport becomes writable. If
    /// that callback acquires any exclusion resources (locks, etc), they
    /// must not be held setting the notifier.
    fn set_notifier(&self, f: Option<TransportNotifier>);
}

pub struct NotifierCell {
    is_set: AtomicBool,
    notifier: Mutex<Option<TransportNotifier>>,
}
impl NotifierCell {
    pub fn new() -> Self {
        Self { is_set: AtomicBool::new(false), notifier: Mutex::new(None) }
    }
    pub fn set(&self, f: Option<TransportNotifier>) {
        let mut guard = self.notifier.lock().unwrap();
        self.is_set.store(f.is_some(), Ordering::Release);
        *guard = f;
    }
    pub fn notify(&self, transport: &dyn Transport) {
        if self.is_set.load(Ordering::Acquire) {
            let guard = self.notifier.lock().unwrap();
            if let Some(f) = guard.as_ref() {
                f(transport);
            }
        }
    }
}
impl Default for NotifierCell {
    fn default() -> Self {
        Self::new()
    }
}
