// Copyright Istio Authors
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

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use crate::telemetry;

/// Ready tracks the sessions that have not started forwarding yet.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
    pub fn new() -> Ready {
        Ready(Default::default())
    }

    fn tasks(&self) -> MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a task that blocks readiness until the returned handle is dropped.
    /// Names must be unique among pending tasks.
    pub fn register_task(&self, name: &str) -> BlockReady {
        let inserted = self.tasks().insert(name.to_string());
        debug_assert!(inserted, "task {name} registered twice");
        BlockReady {
            parent: self.clone(),
            name: name.to_string(),
        }
    }

    pub fn pending(&self) -> HashSet<String> {
        self.tasks().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.tasks().is_empty()
    }
}

/// BlockReady blocks readiness until it is dropped.
#[derive(Debug)]
pub struct BlockReady {
    parent: Ready,
    name: String,
}

impl Drop for BlockReady {
    fn drop(&mut self) {
        let left = {
            let mut pending = self.parent.tasks();
            pending.remove(&self.name);
            pending.len()
        };
        let dur = telemetry::APPLICATION_START_TIME.elapsed();
        if left == 0 {
            info!("Task '{}' settled ({dur:?}), all tunnels settled", self.name);
        } else {
            info!(
                "Task '{}' settled ({dur:?}), still awaiting {left} tunnels",
                self.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_once_every_task_dropped() {
        let ready = Ready::new();
        assert!(ready.is_ready());
        let a = ready.register_task("c1/0");
        let b = ready.register_task("c1/1");
        assert_eq!(ready.pending().len(), 2);
        drop(a);
        assert_eq!(
            ready.pending(),
            HashSet::from(["c1/1".to_string()])
        );
        drop(b);
        assert!(ready.is_ready());
    }
}
