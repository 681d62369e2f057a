// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::prober::LivenessProber;
use crate::prober::ProbeIdentity;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

struct Inner {
    scripted: VecDeque<bool>,
    reachable: bool,
    probed: Vec<String>,
}

/// A fake [`LivenessProber`].
///
/// Answers come from a queue of scripted results first, then from a fixed
/// default (reachable, unless changed).
pub struct FakeProber {
    inner: Mutex<Inner>,
}

impl FakeProber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                scripted: VecDeque::new(),
                reachable: true,
                probed: Vec::new(),
            }),
        })
    }

    /// Answers the next probes with `results`, in order.
    pub fn script(&self, results: &[bool]) {
        self.inner.lock().unwrap().scripted.extend(results);
    }

    /// Answers every probe with `reachable` once the script runs out.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().unwrap().reachable = reachable;
    }

    /// Hosts probed so far, in order.
    pub fn probed(&self) -> Vec<String> {
        self.inner.lock().unwrap().probed.clone()
    }
}

#[async_trait]
impl LivenessProber for FakeProber {
    async fn is_reachable(
        &self,
        host: &str,
        _identity: &ProbeIdentity,
        _timeout: Duration,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.probed.push(host.to_string());
        let default = inner.reachable;
        inner.scripted.pop_front().unwrap_or(default)
    }
}
