//! Coalescing command queue in front of the actor.
//!
//! Rules applied to the backlog at send time:
//!
//! | command | effect |
//! |---|---|
//! | `stop` | backlog cleared, `stop` becomes the only entry |
//! | `reconnect` | other queued `reconnect`s removed, then appended |
//! | anything else | appended |

use crate::command::Command;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Default)]
struct ChannelInner {
    backlog: VecDeque<Command>,
    finished: bool,
}

/// Many producers, one consumer.
#[derive(Default)]
pub struct EventChannel {
    inner: Mutex<ChannelInner>,
    notify: Notify,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never blocks. Commands sent after [`finish`](Self::finish) are dropped.
    pub fn send(&self, command: Command) {
        {
            let mut inner = self.inner.lock();
            if inner.finished {
                trace!("Channel finished, dropping {}", command.name());
                return;
            }
            match command {
                Command::Stop => inner.backlog.clear(),
                Command::Reconnect { .. } => inner
                    .backlog
                    .retain(|queued| !matches!(queued, Command::Reconnect { .. })),
                _ => {}
            }
            inner.backlog.push_back(command);
        }
        self.notify.notify_one();
    }

    /// Next command in FIFO order, or `None` once the channel is finished.
    pub async fn next(&self) -> Option<Command> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if inner.finished {
                    return None;
                }
                if let Some(command) = inner.backlog.pop_front() {
                    return Some(command);
                }
            }
            notified.await;
        }
    }

    /// End the sequence and discard the backlog.
    pub fn finish(&self) {
        {
            let mut inner = self.inner.lock();
            inner.finished = true;
            inner.backlog.clear();
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn len(&self) -> usize {
        self.inner.lock().backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ReconnectReason, StartOptions};
    use fos_tunnel_types::NextRelays;
    use std::sync::Arc;
    use std::time::Duration;

    fn reconnect(next_relays: NextRelays) -> Command {
        Command::Reconnect {
            next_relays,
            reason: ReconnectReason::UserInitiated,
        }
    }

    fn drain(channel: &EventChannel) -> Vec<Command> {
        let mut inner = channel.inner.lock();
        inner.backlog.drain(..).collect()
    }

    #[test]
    fn test_reconnect_coalesces_with_queued_reconnects() {
        let channel = EventChannel::new();
        channel.send(Command::Start(StartOptions::default()));
        channel.send(reconnect(NextRelays::Random));
        channel.send(reconnect(NextRelays::Current));
        channel.send(Command::SwitchKey);
        channel.send(reconnect(NextRelays::Current));

        let consumed = drain(&channel);
        assert_eq!(consumed.len(), 3);
        assert!(matches!(consumed[0], Command::Start(_)));
        assert!(matches!(consumed[1], Command::SwitchKey));
        assert!(matches!(
            consumed[2],
            Command::Reconnect {
                next_relays: NextRelays::Current,
                ..
            }
        ));
    }

    #[test]
    fn test_stop_clears_backlog() {
        let channel = EventChannel::new();
        channel.send(Command::Start(StartOptions::default()));
        channel.send(reconnect(NextRelays::Random));
        channel.send(Command::Stop);
        channel.send(reconnect(NextRelays::Current));
        channel.send(Command::Stop);
        channel.send(Command::SwitchKey);

        let consumed = drain(&channel);
        assert_eq!(consumed.len(), 2);
        assert!(matches!(consumed[0], Command::Stop));
        assert!(matches!(consumed[1], Command::SwitchKey));
    }

    #[test]
    fn test_other_commands_append() {
        let channel = EventChannel::new();
        channel.send(Command::SwitchKey);
        channel.send(Command::SwitchKey);
        channel.send(Command::SetErrorState(crate::state::BlockedReason::Unknown));
        assert_eq!(channel.len(), 3);
    }

    #[tokio::test]
    async fn test_next_yields_in_fifo_order() {
        let channel = EventChannel::new();
        channel.send(Command::Start(StartOptions::default()));
        channel.send(Command::SwitchKey);

        assert!(matches!(channel.next().await, Some(Command::Start(_))));
        assert!(matches!(channel.next().await, Some(Command::SwitchKey)));
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_finish_after_stop_ends_sequence() {
        let channel = EventChannel::new();
        channel.send(Command::Stop);
        channel.finish();

        assert!(channel.next().await.is_none());
        channel.send(Command::SwitchKey);
        assert!(channel.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_next_resumes_on_send() {
        let channel = Arc::new(EventChannel::new());
        let consumer = tokio::spawn({
            let channel = channel.clone();
            async move { channel.next().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.send(Command::SwitchKey);

        let command = consumer.await.unwrap();
        assert!(matches!(command, Some(Command::SwitchKey)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_next_resumes_on_finish() {
        let channel = Arc::new(EventChannel::new());
        let consumer = tokio::spawn({
            let channel = channel.clone();
            async move { channel.next().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.finish();

        assert!(consumer.await.unwrap().is_none());
    }
}
