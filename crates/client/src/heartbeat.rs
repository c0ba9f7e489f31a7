//! Per-channel heartbeat task.
//!
//! Owned by the channel worker: started after a successful connect on
//! channels that require liveness detection, stopped on disconnect. A
//! missed pong only counts a failure; reconnection stays the read path's
//! job. Repeated failures stop the task so a dead link does not spin.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use volant_proto::{ChannelKind, Frame, FramePayload, FrameType};

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub pong_timeout: Duration,
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            max_missed: 3,
        }
    }
}

pub struct Heartbeat {
    config: HeartbeatConfig,
    channel: ChannelKind,
    outbound: mpsc::Sender<Frame>,
    pong_rx: mpsc::Receiver<Vec<u8>>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Heartbeat {
    pub fn new(
        config: HeartbeatConfig,
        channel: ChannelKind,
        outbound: mpsc::Sender<Frame>,
        pong_rx: mpsc::Receiver<Vec<u8>>,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Self {
        Heartbeat {
            config,
            channel,
            outbound,
            pong_rx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            channel = %self.channel,
            interval_secs = self.config.interval.as_secs(),
            "heartbeat started"
        );
        let mut tick = interval(self.config.interval);
        tick.tick().await;
        let mut sequence: u64 = 0;
        let mut missed: u32 = 0;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.beat(sequence).await {
                        missed = 0;
                    } else {
                        missed += 1;
                        warn!(channel = %self.channel, sequence, missed, "heartbeat missed");
                        if missed >= self.config.max_missed {
                            warn!(channel = %self.channel, "heartbeat giving up");
                            return;
                        }
                    }
                    sequence += 1;
                }
                _ = self.shutdown_rx.recv() => {
                    debug!(channel = %self.channel, "heartbeat stopped");
                    return;
                }
            }
        }
    }

    async fn beat(&mut self, sequence: u64) -> bool {
        let payload = sequence.to_be_bytes().to_vec();
        let ping = Frame {
            channel: self.channel,
            sequence: 0,
            frame_type: FrameType::Ping,
            payload: FramePayload::Opaque(payload.clone()),
        };
        if self.outbound.send(ping).await.is_err() {
            return false;
        }
        let wait = timeout(self.config.pong_timeout, async {
            loop {
                match self.pong_rx.recv().await {
                    Some(pong) if pong == payload => return true,
                    Some(_) => continue,
                    None => return false,
                }
            }
        })
        .await;
        matches!(wait, Ok(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_missed: u32) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(100),
            pong_timeout: Duration::from_millis(50),
            max_missed,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pings_and_accepts_matching_pongs() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (pong_tx, pong_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let heartbeat = Heartbeat::new(
            config(2),
            ChannelKind::Presence,
            out_tx,
            pong_rx,
            shutdown_rx,
        );
        let task = tokio::spawn(heartbeat.run());

        for expected in 0u64..3 {
            let frame = out_rx.recv().await.unwrap();
            assert_eq!(frame.frame_type, FrameType::Ping);
            let FramePayload::Opaque(payload) = frame.payload else {
                panic!("ping payload must be opaque");
            };
            assert_eq!(payload, expected.to_be_bytes().to_vec());
            pong_tx.send(payload).await.unwrap();
        }
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_repeated_misses() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (_pong_tx, pong_rx) = mpsc::channel::<Vec<u8>>(8);
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let heartbeat = Heartbeat::new(
            config(2),
            ChannelKind::Presence,
            out_tx,
            pong_rx,
            shutdown_rx,
        );
        let task = tokio::spawn(heartbeat.run());

        // Two beats go unanswered, then the task exits on its own.
        assert!(out_rx.recv().await.is_some());
        assert!(out_rx.recv().await.is_some());
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_task() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (pong_tx, pong_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let heartbeat = Heartbeat::new(
            config(5),
            ChannelKind::Presence,
            out_tx,
            pong_rx,
            shutdown_rx,
        );
        let task = tokio::spawn(heartbeat.run());
        let frame = out_rx.recv().await.unwrap();
        let FramePayload::Opaque(payload) = frame.payload else {
            panic!("ping payload must be opaque");
        };
        pong_tx.send(payload).await.unwrap();
        shutdown_tx.send(()).await.unwrap();
        task.await.unwrap();
    }
}
