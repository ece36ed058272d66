//! Background scan of in-flight and deferred deadlines.
//!
//! A coordinator samples a few channels each tick and hands them to a small
//! worker pool. When a large share of the sample had due work it samples
//! again right away instead of waiting for the next tick, so a backlog of
//! expirations drains quickly without scanning every channel every time.

use crate::config::BrokerConfig;
use crate::metrics::BrokerMetrics;
use crate::storage::Channel;
use crate::topic_manager::TopicManager;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Workers for `channels` channels, at least one and at most `max`
pub fn pool_size(channels: usize, max: usize) -> usize {
    (channels / 4).clamp(1, max.max(1))
}

/// Requeue expired in-flight messages and promote due deferred ones.
/// Returns whether the channel had anything to do.
pub fn scan_channel(channel: &Channel, metrics: &BrokerMetrics) -> bool {
    if channel.is_exiting() {
        debug!(
            "Skipping exiting channel {}/{}",
            channel.topic_name(),
            channel.name()
        );
        return false;
    }

    let now = Instant::now();
    let timed_out = channel.process_in_flight(now);
    let promoted = channel.process_deferred(now);
    if timed_out > 0 {
        metrics.record_timed_out(timed_out as u64);
    }
    if timed_out > 0 || promoted > 0 {
        trace!(
            "{}/{}: {} timed out, {} deferred now ready",
            channel.topic_name(),
            channel.name(),
            timed_out,
            promoted
        );
        return true;
    }
    false
}

struct WorkerPool {
    work_rx: Arc<Mutex<mpsc::Receiver<Arc<Channel>>>>,
    resp_tx: mpsc::Sender<bool>,
    metrics: Arc<BrokerMetrics>,
    workers: Vec<CancellationToken>,
}

impl WorkerPool {
    fn resize(&mut self, target: usize) {
        while self.workers.len() < target {
            let stop = CancellationToken::new();
            tokio::spawn(worker(
                self.work_rx.clone(),
                self.resp_tx.clone(),
                self.metrics.clone(),
                stop.clone(),
            ));
            self.workers.push(stop);
        }
        while self.workers.len() > target {
            if let Some(stop) = self.workers.pop() {
                stop.cancel();
            }
        }
    }

    fn len(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for stop in &self.workers {
            stop.cancel();
        }
    }
}

async fn worker(
    work: Arc<Mutex<mpsc::Receiver<Arc<Channel>>>>,
    resp: mpsc::Sender<bool>,
    metrics: Arc<BrokerMetrics>,
    stop: CancellationToken,
) {
    loop {
        let channel = tokio::select! {
            _ = stop.cancelled() => break,
            channel = async { work.lock().await.recv().await } => match channel {
                Some(channel) => channel,
                None => break,
            },
        };
        let dirty = scan_channel(&channel, &metrics);
        if resp.send(dirty).await.is_err() {
            break;
        }
    }
}

pub struct QueueScanner {
    topics: Arc<TopicManager>,
    metrics: Arc<BrokerMetrics>,
    scan_interval: Duration,
    refresh_interval: Duration,
    selection_count: usize,
    worker_pool_max: usize,
    dirty_percent: f64,
}

impl QueueScanner {
    pub fn new(topics: Arc<TopicManager>, metrics: Arc<BrokerMetrics>, config: &BrokerConfig) -> Self {
        Self {
            topics,
            metrics,
            scan_interval: config.queue_scan_interval(),
            refresh_interval: config.queue_scan_refresh_interval(),
            selection_count: config.queue_scan_selection_count.max(1),
            worker_pool_max: config.queue_scan_worker_pool_max,
            dirty_percent: config.queue_scan_dirty_percent,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let (work_tx, work_rx) = mpsc::channel(self.selection_count);
        let (resp_tx, mut resp_rx) = mpsc::channel(self.selection_count);
        let mut pool = WorkerPool {
            work_rx: Arc::new(Mutex::new(work_rx)),
            resp_tx,
            metrics: self.metrics.clone(),
            workers: Vec::new(),
        };

        let mut channels = self.topics.all_channels();
        pool.resize(pool_size(channels.len(), self.worker_pool_max));

        let mut scan_ticker = interval(self.scan_interval);
        scan_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh_ticker = interval(self.refresh_interval);
        refresh_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Both complete immediately once
        scan_ticker.tick().await;
        refresh_ticker.tick().await;

        info!(
            "Queue scanner started ({:?} interval, {} workers)",
            self.scan_interval,
            pool.len()
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = refresh_ticker.tick() => {
                    channels = self.topics.all_channels();
                    pool.resize(pool_size(channels.len(), self.worker_pool_max));
                    continue;
                }
                _ = scan_ticker.tick() => {}
            }

            if channels.is_empty() {
                continue;
            }

            loop {
                let selected: Vec<Arc<Channel>> = {
                    let mut rng = rand::thread_rng();
                    channels
                        .choose_multiple(&mut rng, self.selection_count)
                        .cloned()
                        .collect()
                };
                let num = selected.len();

                for channel in selected {
                    if work_tx.send(channel).await.is_err() {
                        return;
                    }
                }

                let mut dirty = 0usize;
                for _ in 0..num {
                    match resp_rx.recv().await {
                        Some(true) => dirty += 1,
                        Some(false) => {}
                        None => return,
                    }
                }

                if (dirty as f64) / (num as f64) <= self.dirty_percent || shutdown.is_cancelled() {
                    break;
                }
            }
        }

        debug!("Queue scanner stopped");
    }
}
