// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Client/Server/Auto mode selection.
//!
//! The inbound protocol handler is registered exactly while the node is in
//! Server mode. Auto starts as Client and flips to Server once the routing
//! table proves the node is usefully connected; the transition is one-way.

use std::sync::Mutex;

/// DHT operating mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Outbound only; no inbound handler registered
    Client,
    /// Serve inbound requests
    Server,
    /// Start as Client, switch to Server when sufficiently connected
    Auto,
}

/// Tracks the effective mode across the node lifecycle.
#[derive(Debug)]
pub(crate) struct ModeController {
    configured: Mode,
    current: Mutex<Mode>,
}

impl ModeController {
    pub(crate) fn new(configured: Mode) -> Self {
        let initial = match configured {
            Mode::Server => Mode::Server,
            // Auto behaves as Client until the threshold is crossed.
            Mode::Client | Mode::Auto => Mode::Client,
        };
        Self {
            configured,
            current: Mutex::new(initial),
        }
    }

    pub(crate) fn configured(&self) -> Mode {
        self.configured
    }

    pub(crate) fn current(&self) -> Mode {
        *self.current.lock().expect("mode lock")
    }

    pub(crate) fn is_server(&self) -> bool {
        self.current() == Mode::Server
    }

    /// Evaluate the Auto threshold. Returns true exactly once, when the
    /// transition to Server should happen.
    pub(crate) fn should_activate_server(&self, rt_size: usize, min_peers: usize) -> bool {
        if self.configured != Mode::Auto {
            return false;
        }
        let mut current = self.current.lock().expect("mode lock");
        if *current == Mode::Server || rt_size < min_peers {
            return false;
        }
        *current = Mode::Server;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_modes() {
        assert_eq!(ModeController::new(Mode::Client).current(), Mode::Client);
        assert_eq!(ModeController::new(Mode::Server).current(), Mode::Server);
        assert_eq!(ModeController::new(Mode::Auto).current(), Mode::Client);
    }

    #[test]
    fn test_auto_flips_exactly_once_at_threshold() {
        let controller = ModeController::new(Mode::Auto);
        assert!(!controller.should_activate_server(3, 4));
        assert_eq!(controller.current(), Mode::Client);

        assert!(controller.should_activate_server(4, 4));
        assert_eq!(controller.current(), Mode::Server);

        // Second crossing reports nothing to do.
        assert!(!controller.should_activate_server(10, 4));
    }

    #[test]
    fn test_client_mode_never_activates_server() {
        let controller = ModeController::new(Mode::Client);
        assert!(!controller.should_activate_server(100, 4));
        assert_eq!(controller.current(), Mode::Client);
    }
}
