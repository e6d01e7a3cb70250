// Copyright 2025 jonefeewang@gmail.com
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

use tokio::sync::broadcast;

/// Sending side of the shutdown signal, cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    notify: broadcast::Sender<()>,
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        let (notify, _) = broadcast::channel(1);
        ShutdownTrigger { notify }
    }
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.notify.subscribe())
    }

    /// Returns how many listeners were still waiting.
    pub fn trigger(&self) -> usize {
        self.notify.send(()).unwrap_or(0)
    }
}

/// Waits for a [`ShutdownTrigger`]; once fired it stays fired.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // a closed channel means every trigger is gone, treat it as shutdown too
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
