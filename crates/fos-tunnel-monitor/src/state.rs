//! Liveness evaluation.
//!
//! [`TunnelMonitorState::evaluate_connection`] is a pure function of the
//! fields below and the `now`/`ping_timeout` passed in.

use crate::pinger::PingerSendResult;
use fos_tunnel_types::{TunnelMonitorTimings, TunnelStats};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Outstanding requests kept for reply matching
const MAX_OUTSTANDING_REQUESTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMonitorConnectionState {
    Stopped,
    /// Started while the network was unreachable
    PendingStart,
    Connecting,
    Connected,
    /// Connection lost; waiting to be restarted
    Recovering,
    /// Network went away after starting
    WaitingConnectivity,
}

/// Verdict of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvaluation {
    Ok,
    SendInitialPing,
    SendNextPing,
    SendHeartbeatPing,
    RetryHeartbeatPing,
    SuspendHeartbeat,
    PingTimeout,
    TrafficTimeout,
    InboundTrafficTimeout,
}

#[derive(Debug, Clone, Default)]
pub struct PingStats {
    /// Sequence number → send time
    pub requests: HashMap<u16, Instant>,
    pub last_request_date: Option<Instant>,
    pub last_reply_date: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct TunnelMonitorState {
    pub connection_state: TunnelMonitorConnectionState,
    pub net_stats: TunnelStats,
    pub ping_stats: PingStats,
    /// Start of the current ping timeout window
    pub timeout_reference: Instant,
    pub last_seen_rx: Option<Instant>,
    pub last_seen_tx: Option<Instant>,
    pub is_heartbeat_suspended: bool,
    pub retry_attempt: u32,
    pub timings: TunnelMonitorTimings,
}

impl TunnelMonitorState {
    pub fn new(timings: TunnelMonitorTimings, now: Instant) -> Self {
        Self {
            connection_state: TunnelMonitorConnectionState::Stopped,
            net_stats: TunnelStats::default(),
            ping_stats: PingStats::default(),
            timeout_reference: now,
            last_seen_rx: None,
            last_seen_tx: None,
            is_heartbeat_suspended: false,
            retry_attempt: 0,
            timings,
        }
    }

    pub fn evaluate_connection(&self, now: Instant, ping_timeout: Duration) -> ConnectionEvaluation {
        match self.connection_state {
            TunnelMonitorConnectionState::Connecting => self.evaluate_connecting(now, ping_timeout),
            TunnelMonitorConnectionState::Connected => self.evaluate_connected(now, ping_timeout),
            TunnelMonitorConnectionState::Stopped
            | TunnelMonitorConnectionState::PendingStart
            | TunnelMonitorConnectionState::Recovering
            | TunnelMonitorConnectionState::WaitingConnectivity => ConnectionEvaluation::Ok,
        }
    }

    fn evaluate_connecting(&self, now: Instant, ping_timeout: Duration) -> ConnectionEvaluation {
        let Some(last_request) = self.ping_stats.last_request_date else {
            return ConnectionEvaluation::SendInitialPing;
        };
        if now.saturating_duration_since(self.timeout_reference) >= ping_timeout {
            return ConnectionEvaluation::PingTimeout;
        }
        if now.saturating_duration_since(last_request) >= self.timings.ping_delay {
            return ConnectionEvaluation::SendNextPing;
        }
        ConnectionEvaluation::Ok
    }

    fn evaluate_connected(&self, now: Instant, ping_timeout: Duration) -> ConnectionEvaluation {
        let Some(last_request) = self.ping_stats.last_request_date else {
            return ConnectionEvaluation::SendInitialPing;
        };

        if !self.is_heartbeat_suspended
            && now.saturating_duration_since(self.timeout_reference) >= ping_timeout
        {
            return ConnectionEvaluation::PingTimeout;
        }

        let since_last_request = now.saturating_duration_since(last_request);
        let is_unanswered = self
            .ping_stats
            .last_reply_date
            .is_none_or(|reply| reply < last_request);

        if !self.is_heartbeat_suspended
            && is_unanswered
            && since_last_request >= self.timings.heartbeat_reply_timeout
            && since_last_request >= self.timings.ping_delay
        {
            return ConnectionEvaluation::SendNextPing;
        }

        if let Some(evaluation) = self.evaluate_traffic(now) {
            return evaluation;
        }

        if since_last_request >= self.timings.heartbeat_ping_interval {
            return if self.is_traffic_flowing(now) {
                if self.is_heartbeat_suspended {
                    ConnectionEvaluation::Ok
                } else {
                    ConnectionEvaluation::SuspendHeartbeat
                }
            } else if self.is_heartbeat_suspended {
                ConnectionEvaluation::SendHeartbeatPing
            } else if is_unanswered {
                ConnectionEvaluation::Ok
            } else {
                ConnectionEvaluation::RetryHeartbeatPing
            };
        }

        ConnectionEvaluation::Ok
    }

    fn evaluate_traffic(&self, now: Instant) -> Option<ConnectionEvaluation> {
        let (Some(rx), Some(tx)) = (self.last_seen_rx, self.last_seen_tx) else {
            return None;
        };
        let rx_idle = now.saturating_duration_since(rx);
        let tx_idle = now.saturating_duration_since(tx);

        if rx_idle >= self.timings.traffic_timeout && tx_idle >= self.timings.traffic_timeout {
            return Some(ConnectionEvaluation::TrafficTimeout);
        }
        if tx > rx && tx.saturating_duration_since(rx) >= self.timings.inbound_traffic_timeout {
            return Some(ConnectionEvaluation::InboundTrafficTimeout);
        }
        None
    }

    fn is_traffic_flowing(&self, now: Instant) -> bool {
        let within = |seen: Option<Instant>| {
            seen.is_some_and(|at| now.saturating_duration_since(at) < self.timings.traffic_flow_timeout)
        };
        within(self.last_seen_rx) || within(self.last_seen_tx)
    }

    /// Timeout to pass to [`Self::evaluate_connection`] for the current state.
    pub fn ping_timeout(&self) -> Duration {
        match self.connection_state {
            TunnelMonitorConnectionState::Connecting => {
                self.timings.establish_timeout(self.retry_attempt)
            }
            _ => self.timings.ping_timeout,
        }
    }

    /// Record fresh device counters; growth in either direction marks it as seen.
    pub fn update_net_stats(&mut self, stats: TunnelStats, now: Instant) {
        if stats.bytes_received > self.net_stats.bytes_received {
            self.last_seen_rx = Some(now);
        }
        if stats.bytes_sent > self.net_stats.bytes_sent {
            self.last_seen_tx = Some(now);
        }
        self.net_stats = stats;
    }

    pub fn update_ping_stats(&mut self, send_result: PingerSendResult, now: Instant) {
        if self.ping_stats.requests.len() >= MAX_OUTSTANDING_REQUESTS {
            let oldest = self
                .ping_stats
                .requests
                .iter()
                .min_by_key(|(_, sent_at)| **sent_at)
                .map(|(sequence, _)| *sequence);
            if let Some(oldest) = oldest {
                self.ping_stats.requests.remove(&oldest);
            }
        }
        self.ping_stats
            .requests
            .insert(send_result.sequence_number, now);
        self.ping_stats.last_request_date = Some(now);
    }

    /// A send that never reached the socket still counts against the timeout.
    pub fn record_failed_send(&mut self, now: Instant) {
        self.ping_stats.last_request_date = Some(now);
    }

    /// Match a reply to an outstanding request. Returns the send time, or
    /// `None` if the sequence number is unknown.
    pub fn set_ping_reply_received(&mut self, sequence_number: u16, now: Instant) -> Option<Instant> {
        let sent_at = self.ping_stats.requests.remove(&sequence_number)?;
        self.ping_stats.last_reply_date = Some(now);
        self.timeout_reference = now;
        Some(sent_at)
    }

    /// Clear every counter. The retry attempt is reset as well.
    pub fn reset(&mut self, now: Instant) {
        self.net_stats = TunnelStats::default();
        self.ping_stats = PingStats::default();
        self.timeout_reference = now;
        self.last_seen_rx = None;
        self.last_seen_tx = None;
        self.is_heartbeat_suspended = false;
        self.retry_attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_in(connection_state: TunnelMonitorConnectionState, now: Instant) -> TunnelMonitorState {
        let mut state = TunnelMonitorState::new(TunnelMonitorTimings::default(), now);
        state.connection_state = connection_state;
        state
    }

    fn sent(sequence_number: u16) -> PingerSendResult {
        PingerSendResult {
            sequence_number,
            bytes_sent: 8,
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_passive_states_evaluate_ok() {
        let now = Instant::now();
        for connection_state in [
            TunnelMonitorConnectionState::Stopped,
            TunnelMonitorConnectionState::PendingStart,
            TunnelMonitorConnectionState::Recovering,
            TunnelMonitorConnectionState::WaitingConnectivity,
        ] {
            let state = state_in(connection_state, now);
            assert_eq!(
                state.evaluate_connection(now + secs(600), secs(15)),
                ConnectionEvaluation::Ok
            );
        }
    }

    #[test]
    fn test_first_evaluation_sends_initial_ping() {
        let now = Instant::now();
        let state = state_in(TunnelMonitorConnectionState::Connecting, now);
        assert_eq!(
            state.evaluate_connection(now, secs(15)),
            ConnectionEvaluation::SendInitialPing
        );

        let connected = state_in(TunnelMonitorConnectionState::Connected, now);
        assert_eq!(
            connected.evaluate_connection(now, secs(15)),
            ConnectionEvaluation::SendInitialPing
        );
    }

    #[test]
    fn test_unanswered_ping_times_out_after_full_timeout() {
        let start = Instant::now();
        let mut state = state_in(TunnelMonitorConnectionState::Connecting, start);
        let timeout = state.ping_timeout();
        state.update_ping_stats(sent(1), start);

        assert_eq!(state.evaluate_connection(start + secs(1), timeout), ConnectionEvaluation::Ok);
        assert_eq!(
            state.evaluate_connection(start + secs(3), timeout),
            ConnectionEvaluation::SendNextPing
        );
        assert_eq!(
            state.evaluate_connection(start + timeout, timeout),
            ConnectionEvaluation::PingTimeout
        );
    }

    #[test]
    fn test_establish_timeout_grows_with_retries() {
        let now = Instant::now();
        let mut state = state_in(TunnelMonitorConnectionState::Connecting, now);
        assert_eq!(state.ping_timeout(), secs(4));

        state.retry_attempt = 1;
        assert_eq!(state.ping_timeout(), secs(8));

        state.connection_state = TunnelMonitorConnectionState::Connected;
        assert_eq!(state.ping_timeout(), secs(15));
    }

    #[test]
    fn test_reply_resets_timeout_reference() {
        let start = Instant::now();
        let mut state = state_in(TunnelMonitorConnectionState::Connecting, start);
        state.update_ping_stats(sent(1), start);

        let sent_at = state.set_ping_reply_received(1, start + secs(2));
        assert_eq!(sent_at, Some(start));
        assert_eq!(state.timeout_reference, start + secs(2));
        assert!(state.set_ping_reply_received(1, start + secs(3)).is_none());
        assert!(state.set_ping_reply_received(99, start + secs(3)).is_none());
    }

    #[test]
    fn test_heartbeat_retries_after_answered_ping() {
        let start = Instant::now();
        let mut state = state_in(TunnelMonitorConnectionState::Connected, start);
        state.update_ping_stats(sent(1), start);
        state.set_ping_reply_received(1, start);

        assert_eq!(state.evaluate_connection(start + secs(5), secs(15)), ConnectionEvaluation::Ok);
        assert_eq!(
            state.evaluate_connection(start + secs(10), secs(15)),
            ConnectionEvaluation::RetryHeartbeatPing
        );
    }

    #[test]
    fn test_heartbeat_suspends_while_traffic_flows() {
        let start = Instant::now();
        let mut state = state_in(TunnelMonitorConnectionState::Connected, start);
        state.update_ping_stats(sent(1), start);
        state.set_ping_reply_received(1, start);
        state.update_net_stats(
            TunnelStats {
                bytes_sent: 1000,
                bytes_received: 4000,
            },
            start + secs(9),
        );

        assert_eq!(
            state.evaluate_connection(start + secs(10), secs(15)),
            ConnectionEvaluation::SuspendHeartbeat
        );

        state.is_heartbeat_suspended = true;
        assert_eq!(
            state.evaluate_connection(start + secs(11), secs(15)),
            ConnectionEvaluation::Ok
        );
        // Traffic stopped beyond the flow window: resume pinging
        assert_eq!(
            state.evaluate_connection(start + secs(20), secs(15)),
            ConnectionEvaluation::SendHeartbeatPing
        );
    }

    #[test]
    fn test_outbound_only_traffic_is_inbound_timeout() {
        let start = Instant::now();
        let mut state = state_in(TunnelMonitorConnectionState::Connected, start);
        state.update_ping_stats(sent(1), start);
        state.set_ping_reply_received(1, start);
        state.is_heartbeat_suspended = true;
        state.last_seen_rx = Some(start);
        state.last_seen_tx = Some(start + secs(6));

        assert_eq!(
            state.evaluate_connection(start + secs(7), secs(15)),
            ConnectionEvaluation::InboundTrafficTimeout
        );
    }

    #[test]
    fn test_no_traffic_at_all_is_traffic_timeout() {
        let start = Instant::now();
        let mut state = state_in(TunnelMonitorConnectionState::Connected, start);
        state.update_ping_stats(sent(1), start);
        state.set_ping_reply_received(1, start);
        state.is_heartbeat_suspended = true;
        state.last_seen_rx = Some(start);
        state.last_seen_tx = Some(start);

        assert_eq!(
            state.evaluate_connection(start + secs(120), secs(15)),
            ConnectionEvaluation::TrafficTimeout
        );
    }

    #[test]
    fn test_reset_clears_counters() {
        let start = Instant::now();
        let mut state = state_in(TunnelMonitorConnectionState::Connected, start);
        state.update_ping_stats(sent(1), start);
        state.update_net_stats(
            TunnelStats {
                bytes_sent: 1,
                bytes_received: 1,
            },
            start,
        );
        state.retry_attempt = 3;
        state.is_heartbeat_suspended = true;

        state.reset(start + secs(1));

        assert!(state.ping_stats.requests.is_empty());
        assert!(state.ping_stats.last_request_date.is_none());
        assert_eq!(state.net_stats, TunnelStats::default());
        assert_eq!(state.retry_attempt, 0);
        assert!(!state.is_heartbeat_suspended);
        assert!(state.last_seen_rx.is_none());
    }
}
