//! Bounded Wi-Fi station recovery.
//!
//! Driven by station events, not by polling: an association attempt only
//! counts once the station reports it failed, however long it takes. A lost
//! link is retried a fixed number of times; after that the node keeps running
//! BLE-only and stops trying until the link reappears on its own.

use log::{info, warn};

use crate::error::ConnectivityError;

/// Station events the policy reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Station interface started; the first association is not a retry.
    Started,
    /// Association failed or an established link dropped.
    Disconnected,
    GotIp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Start the initial association.
    Connect,
    /// Link just came up. `first` is true only for the first time since boot.
    LinkUp { first: bool },
    Steady,
    Reconnect { attempt: u32 },
    GiveUp(ConnectivityError),
    Offline,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    attempts: u32,
    up: bool,
    ever_up: bool,
    exhausted: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            up: false,
            ever_up: false,
            exhausted: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn handle_event(&mut self, event: LinkEvent) -> LinkAction {
        match event {
            LinkEvent::Started => {
                info!("wifi station started");
                LinkAction::Connect
            }
            LinkEvent::Disconnected => self.observe(false),
            LinkEvent::GotIp => self.observe(true),
        }
    }

    pub fn observe(&mut self, connected: bool) -> LinkAction {
        if connected {
            if self.up {
                return LinkAction::Steady;
            }
            let first = !self.ever_up;
            info!("wifi link up after {} attempt(s)", self.attempts);
            self.up = true;
            self.ever_up = true;
            self.attempts = 0;
            self.exhausted = false;
            return LinkAction::LinkUp { first };
        }

        if self.up {
            warn!("wifi link lost");
            self.up = false;
        }

        if self.exhausted {
            return LinkAction::Offline;
        }

        if self.attempts < self.max_attempts {
            self.attempts += 1;
            info!(
                "retry to connect to the AP ({}/{})",
                self.attempts, self.max_attempts
            );
            return LinkAction::Reconnect {
                attempt: self.attempts,
            };
        }

        self.exhausted = true;
        let err = ConnectivityError::RetriesExhausted(self.attempts);
        warn!("connect to the AP fail: {err}");
        LinkAction::GiveUp(err)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn first_link_up_is_flagged_once() {
        let mut policy = ReconnectPolicy::new(5);
        assert_eq!(policy.observe(true), LinkAction::LinkUp { first: true });
        assert_eq!(policy.observe(true), LinkAction::Steady);

        assert_eq!(policy.observe(false), LinkAction::Reconnect { attempt: 1 });
        assert_eq!(policy.observe(true), LinkAction::LinkUp { first: false });
    }

    #[test]
    fn retries_are_bounded_then_silent() {
        let mut policy = ReconnectPolicy::new(5);
        for attempt in 1..=5 {
            assert_eq!(policy.observe(false), LinkAction::Reconnect { attempt });
        }
        assert_eq!(
            policy.observe(false),
            LinkAction::GiveUp(ConnectivityError::RetriesExhausted(5))
        );
        assert_eq!(policy.observe(false), LinkAction::Offline);
        assert_eq!(policy.observe(false), LinkAction::Offline);
    }

    #[test]
    fn successful_connection_resets_retry_budget() {
        let mut policy = ReconnectPolicy::new(2);
        policy.observe(false);
        policy.observe(false);
        assert_eq!(policy.observe(true), LinkAction::LinkUp { first: true });
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.observe(false), LinkAction::Reconnect { attempt: 1 });
    }

    #[test]
    fn link_returning_after_give_up_is_accepted() {
        let mut policy = ReconnectPolicy::new(1);
        policy.observe(false);
        assert!(matches!(policy.observe(false), LinkAction::GiveUp(_)));
        assert_eq!(policy.observe(true), LinkAction::LinkUp { first: true });
        assert!(policy.is_up());
    }

    #[test]
    fn slow_association_spends_retries_only_on_reported_failures() {
        let mut policy = ReconnectPolicy::new(5);
        assert_eq!(policy.handle_event(LinkEvent::Started), LinkAction::Connect);
        assert_eq!(policy.attempts(), 0);

        for attempt in 1..=4 {
            assert_eq!(
                policy.handle_event(LinkEvent::Disconnected),
                LinkAction::Reconnect { attempt }
            );
        }
        assert_eq!(
            policy.handle_event(LinkEvent::GotIp),
            LinkAction::LinkUp { first: true }
        );
        assert_eq!(policy.attempts(), 0);

        // DHCP renewal on an established link.
        assert_eq!(policy.handle_event(LinkEvent::GotIp), LinkAction::Steady);
        assert_eq!(
            policy.handle_event(LinkEvent::Disconnected),
            LinkAction::Reconnect { attempt: 1 }
        );
        assert_eq!(
            policy.handle_event(LinkEvent::GotIp),
            LinkAction::LinkUp { first: false }
        );
    }
}
