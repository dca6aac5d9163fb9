//! Connection lifecycle state machine.
//!
//! ```text
//! Disconnected --connect--> Connecting --link up--> Connected{ready: false}
//!                               ^                        | discovery complete
//!                               | reconnect timer        v
//!                  Reconnecting{attempt, delay} <-- Connected{ready: true}
//!                               |                 abnormal teardown
//!                               | attempt > max
//!                               v
//!                        Failed{code}
//! ```
//!
//! The machine is sans-IO: every input returns a list of [`ConnectionAction`]s
//! for the controller to carry out. Timers are identified by an epoch; a
//! timer whose epoch is no longer current is ignored.

use std::fmt;
use std::time::Duration;

use tracing::{error, info, warn};

use super::timing::ReconnectBackoff;
use crate::config::LinkConfig;
use crate::core::CODE_WATCHDOG_TIMEOUT;
use crate::crypto::OwnerId;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link and no pending reconnect.
    Disconnected,
    /// Link being opened.
    Connecting,
    /// Waiting to retry after an abnormal teardown.
    Reconnecting {
        /// 1-based reconnect attempt.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Link up; `ready` once capability discovery finished.
    Connected {
        /// Discovery complete.
        ready: bool,
    },
    /// Reconnect attempts exhausted.
    Failed {
        /// Last error code seen.
        code: i32,
    },
}

impl ConnectionState {
    /// Whether fragments can be exchanged.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Connected { ready: true })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt}, in {}ms)", delay.as_millis())
            }
            Self::Connected { ready: false } => f.write_str("connected (discovering)"),
            Self::Connected { ready: true } => f.write_str("connected"),
            Self::Failed { code } => write!(f, "failed (code {code})"),
        }
    }
}

/// Which watchdog a timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogKind {
    /// Link must come up.
    Connect,
    /// Discovery must complete.
    Discovery,
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open the active transport to `peer`.
    OpenLink {
        /// Peer to connect to.
        peer: OwnerId,
    },
    /// Start capability discovery.
    Discover,
    /// Release transport resources.
    TearDown,
    /// Arm a watchdog.
    StartWatchdog {
        /// Which watchdog.
        kind: WatchdogKind,
        /// Timer epoch.
        epoch: u64,
        /// Timeout.
        after: Duration,
    },
    /// Arm the reconnect timer.
    ScheduleReconnect {
        /// Timer epoch.
        epoch: u64,
        /// Delay.
        after: Duration,
    },
    /// Abort the current transfer and reassembly.
    AbortTransfers,
    /// Run teardown key deletion for `owner`.
    DropKey {
        /// Peer whose key to delete.
        peer: OwnerId,
    },
    /// Publish the new state.
    Emit(ConnectionState),
}

/// Connection supervisor for the active transport.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    peer: Option<OwnerId>,
    attempt: u32,
    epoch: u64,
    auto_reconnect: bool,
    backoff: ReconnectBackoff,
    connect_watchdog: Duration,
    discovery_watchdog: Duration,
}

impl ConnectionStateMachine {
    /// Create a machine in [`ConnectionState::Disconnected`].
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            peer: None,
            attempt: 0,
            epoch: 0,
            auto_reconnect: false,
            backoff: ReconnectBackoff::from_config(&config.timing, &config.retry),
            connect_watchdog: config.timing.connect_watchdog(),
            discovery_watchdog: config.timing.discovery_watchdog(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Peer of the current or last connection.
    pub fn peer(&self) -> Option<&OwnerId> {
        self.peer.as_ref()
    }

    /// Current reconnect attempt (0 when stable).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Current timer epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    fn transition(&mut self, state: ConnectionState, actions: &mut Vec<ConnectionAction>) {
        if self.state != state {
            info!(from = %self.state, to = %state, "connection state");
            self.state = state;
            actions.push(ConnectionAction::Emit(state));
        }
    }

    fn start_connecting(&mut self, actions: &mut Vec<ConnectionAction>) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        let epoch = self.next_epoch();
        self.transition(ConnectionState::Connecting, actions);
        actions.push(ConnectionAction::OpenLink { peer });
        actions.push(ConnectionAction::StartWatchdog {
            kind: WatchdogKind::Connect,
            epoch,
            after: self.connect_watchdog,
        });
    }

    /// Explicit connect. Re-arms auto-reconnect and resets the attempt count.
    pub fn connect(&mut self, peer: OwnerId) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected { .. }) {
            actions.push(ConnectionAction::AbortTransfers);
            actions.push(ConnectionAction::TearDown);
        }
        info!(peer = %peer, "connect");
        self.peer = Some(peer);
        self.attempt = 0;
        self.auto_reconnect = true;
        self.start_connecting(&mut actions);
        actions
    }

    /// Explicit user disconnect: cancels timers and disables auto-reconnect.
    pub fn disconnect(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        self.auto_reconnect = false;
        self.attempt = 0;
        self.next_epoch();
        if self.state == ConnectionState::Disconnected {
            return actions;
        }
        actions.push(ConnectionAction::AbortTransfers);
        actions.push(ConnectionAction::TearDown);
        if let Some(peer) = self.peer.clone() {
            actions.push(ConnectionAction::DropKey { peer });
        }
        self.transition(ConnectionState::Disconnected, &mut actions);
        actions
    }

    /// The transport reports the link is up.
    pub fn on_link_up(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.state != ConnectionState::Connecting {
            return actions;
        }
        let epoch = self.next_epoch();
        self.transition(ConnectionState::Connected { ready: false }, &mut actions);
        actions.push(ConnectionAction::Discover);
        actions.push(ConnectionAction::StartWatchdog {
            kind: WatchdogKind::Discovery,
            epoch,
            after: self.discovery_watchdog,
        });
        actions
    }

    /// The transport reports discovery finished.
    pub fn on_discovery_complete(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.state != (ConnectionState::Connected { ready: false }) {
            return actions;
        }
        self.next_epoch();
        self.attempt = 0;
        self.transition(ConnectionState::Connected { ready: true }, &mut actions);
        actions
    }

    /// The transport reports the link went down.
    pub fn on_link_down(&mut self, user_initiated: bool, code: Option<i32>) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if !self.auto_reconnect
            || matches!(
                self.state,
                ConnectionState::Disconnected | ConnectionState::Failed { .. } | ConnectionState::Reconnecting { .. }
            )
        {
            return actions;
        }

        if user_initiated && code.is_none() {
            self.auto_reconnect = false;
            self.next_epoch();
            actions.push(ConnectionAction::AbortTransfers);
            if let Some(peer) = self.peer.clone() {
                actions.push(ConnectionAction::DropKey { peer });
            }
            self.transition(ConnectionState::Disconnected, &mut actions);
            return actions;
        }

        warn!(code = ?code, state = %self.state, "link lost");
        actions.push(ConnectionAction::AbortTransfers);
        actions.push(ConnectionAction::TearDown);
        self.schedule_reconnect(code.unwrap_or_default(), &mut actions);
        actions
    }

    /// A watchdog fired.
    pub fn on_watchdog(&mut self, kind: WatchdogKind, epoch: u64) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if epoch != self.epoch {
            return actions;
        }
        let stuck = match kind {
            WatchdogKind::Connect => {
                matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected { ready: false })
            }
            WatchdogKind::Discovery => self.state == (ConnectionState::Connected { ready: false }),
        };
        if !stuck {
            return actions;
        }

        warn!(?kind, state = %self.state, "watchdog fired, forcing reset");
        actions.push(ConnectionAction::AbortTransfers);
        actions.push(ConnectionAction::TearDown);
        self.schedule_reconnect(CODE_WATCHDOG_TIMEOUT, &mut actions);
        actions
    }

    /// The reconnect timer fired.
    pub fn on_reconnect_timer(&mut self, epoch: u64) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if epoch != self.epoch || !matches!(self.state, ConnectionState::Reconnecting { .. }) {
            return actions;
        }
        self.start_connecting(&mut actions);
        actions
    }

    fn schedule_reconnect(&mut self, code: i32, actions: &mut Vec<ConnectionAction>) {
        self.attempt += 1;
        let epoch = self.next_epoch();
        match self.backoff.delay(self.attempt) {
            Some(delay) => {
                self.transition(
                    ConnectionState::Reconnecting {
                        attempt: self.attempt,
                        delay,
                    },
                    actions,
                );
                actions.push(ConnectionAction::ScheduleReconnect { epoch, after: delay });
            }
            None => {
                error!(attempts = self.attempt - 1, code, "reconnect attempts exhausted");
                self.auto_reconnect = false;
                if let Some(peer) = self.peer.clone() {
                    actions.push(ConnectionAction::DropKey { peer });
                }
                self.transition(ConnectionState::Failed { code }, actions);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ConnectionStateMachine {
        ConnectionStateMachine::new(&LinkConfig::default())
    }

    fn peer() -> OwnerId {
        OwnerId::new("AA:BB:CC:DD:EE:FF")
    }

    fn reconnect_epoch(actions: &[ConnectionAction]) -> Option<(u64, Duration)> {
        actions.iter().find_map(|a| match a {
            ConnectionAction::ScheduleReconnect { epoch, after } => Some((*epoch, *after)),
            _ => None,
        })
    }

    fn watchdog_epoch(actions: &[ConnectionAction]) -> Option<(WatchdogKind, u64)> {
        actions.iter().find_map(|a| match a {
            ConnectionAction::StartWatchdog { kind, epoch, .. } => Some((*kind, *epoch)),
            _ => None,
        })
    }

    fn bring_up(m: &mut ConnectionStateMachine) {
        m.connect(peer());
        m.on_link_up();
        m.on_discovery_complete();
        assert_eq!(m.state(), ConnectionState::Connected { ready: true });
    }

    #[test]
    fn test_happy_path() {
        let mut m = machine();
        let actions = m.connect(peer());
        assert!(actions.contains(&ConnectionAction::OpenLink { peer: peer() }));
        assert!(actions.contains(&ConnectionAction::Emit(ConnectionState::Connecting)));
        assert_eq!(watchdog_epoch(&actions).map(|w| w.0), Some(WatchdogKind::Connect));

        let actions = m.on_link_up();
        assert!(actions.contains(&ConnectionAction::Discover));
        assert_eq!(m.state(), ConnectionState::Connected { ready: false });
        assert_eq!(watchdog_epoch(&actions).map(|w| w.0), Some(WatchdogKind::Discovery));

        let actions = m.on_discovery_complete();
        assert_eq!(actions, vec![ConnectionAction::Emit(ConnectionState::Connected { ready: true })]);
        assert!(m.state().is_ready());
    }

    #[test]
    fn test_backoff_sequence_then_failed() {
        let mut m = machine();
        bring_up(&mut m);

        let mut delays = Vec::new();
        let mut actions = m.on_link_down(false, Some(8));
        loop {
            match reconnect_epoch(&actions) {
                Some((epoch, after)) => {
                    delays.push(after.as_secs());
                    let reconnect = m.on_reconnect_timer(epoch);
                    assert_eq!(m.state(), ConnectionState::Connecting);
                    // The attempt times out.
                    let (kind, wd) = watchdog_epoch(&reconnect).unwrap();
                    actions = m.on_watchdog(kind, wd);
                }
                None => break,
            }
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10, 10, 10]);
        assert_eq!(m.state(), ConnectionState::Failed { code: CODE_WATCHDOG_TIMEOUT });
        assert!(actions.contains(&ConnectionAction::DropKey { peer: peer() }));
        // No more automatic activity once failed.
        assert!(m.on_link_down(false, Some(1)).is_empty());
    }

    #[test]
    fn test_discovery_resets_attempts() {
        let mut m = machine();
        bring_up(&mut m);
        let (epoch, _) = reconnect_epoch(&m.on_link_down(false, Some(19))).unwrap();
        assert_eq!(m.attempt(), 1);
        m.on_reconnect_timer(epoch);
        m.on_link_up();
        m.on_discovery_complete();
        assert_eq!(m.attempt(), 0);

        let actions = m.on_link_down(false, Some(19));
        assert!(actions.contains(&ConnectionAction::Emit(ConnectionState::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(1),
        })));
    }

    #[test]
    fn test_user_disconnect_suppresses_reconnect() {
        let mut m = machine();
        bring_up(&mut m);
        let actions = m.disconnect();
        assert!(actions.contains(&ConnectionAction::TearDown));
        assert!(actions.contains(&ConnectionAction::AbortTransfers));
        assert!(actions.contains(&ConnectionAction::DropKey { peer: peer() }));
        assert_eq!(m.state(), ConnectionState::Disconnected);

        // The platform's own teardown report arrives afterwards.
        assert!(m.on_link_down(true, None).is_empty());
        assert!(m.on_link_down(false, Some(8)).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_cancels_pending_reconnect() {
        let mut m = machine();
        bring_up(&mut m);
        let (epoch, _) = reconnect_epoch(&m.on_link_down(false, Some(8))).unwrap();
        m.disconnect();
        assert!(m.on_reconnect_timer(epoch).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_user_initiated_teardown_without_code() {
        let mut m = machine();
        bring_up(&mut m);
        let actions = m.on_link_down(true, None);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(reconnect_epoch(&actions).is_none());
    }

    #[test]
    fn test_user_initiated_teardown_with_code_reconnects() {
        let mut m = machine();
        bring_up(&mut m);
        m.on_link_down(true, Some(133));
        assert!(matches!(m.state(), ConnectionState::Reconnecting { attempt: 1, .. }));
    }

    #[test]
    fn test_stale_watchdog_ignored() {
        let mut m = machine();
        let (kind, epoch) = watchdog_epoch(&m.connect(peer())).unwrap();
        m.on_link_up();
        m.on_discovery_complete();
        assert!(m.on_watchdog(kind, epoch).is_empty());
        assert!(m.state().is_ready());
    }

    #[test]
    fn test_discovery_watchdog_forces_reset() {
        let mut m = machine();
        m.connect(peer());
        let (kind, epoch) = watchdog_epoch(&m.on_link_up()).unwrap();
        let actions = m.on_watchdog(kind, epoch);
        assert!(actions.contains(&ConnectionAction::TearDown));
        assert!(matches!(m.state(), ConnectionState::Reconnecting { attempt: 1, .. }));
    }

    #[test]
    fn test_reconnect_keeps_key() {
        let mut m = machine();
        bring_up(&mut m);
        let actions = m.on_link_down(false, Some(8));
        assert!(!actions.iter().any(|a| matches!(a, ConnectionAction::DropKey { .. })));
    }
}
