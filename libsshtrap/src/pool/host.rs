// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

/// One pooled backend container.
///
/// `running` flips to true once the container has been started, and
/// `occupied` flips to true exactly once, when the host is leased to a
/// session. A leased host is never handed out again; it is destroyed
/// when its session ends.
#[derive(Debug)]
pub struct PooledHost {
    id: String,
    running: AtomicBool,
    occupied: AtomicBool,
}

impl PooledHost {
    pub fn new(id: String, occupied: bool) -> Self {
        PooledHost {
            id,
            running: AtomicBool::new(false),
            occupied: AtomicBool::new(occupied),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, val: bool) {
        self.running.store(val, Ordering::Release);
    }

    pub fn occupied(&self) -> bool {
        self.occupied.load(Ordering::Acquire)
    }

    /// Attempt to lease this host. Succeeds iff the container is running
    /// and nobody else has claimed it; the claim itself is a single
    /// compare-and-swap, so two racing callers can never both win.
    pub fn try_occupy(&self) -> bool {
        if !self.running() {
            return false;
        }
        let won = self
            .occupied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            debug!(id = %self.id, "host leased");
        }
        won
    }
}
