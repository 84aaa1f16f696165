//! Packet pipeline: a pool of short CPU-bound workers in front of
//! `classify`. Every packet of one (src, dst, ports) tuple hashes to the
//! same worker queue, so per-flow arrival order is preserved end to end.
//! Forwarded packets come back through the write-back hook; dropped ones
//! simply never do.

use std::sync::Arc;

use arc_swap::ArcSwap;
use guard_filter::RuleSet;
use guard_inspect::{classify, flow_hash, Decision, IpFamily};
use guard_observe::StatsRegistry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Packets the shell re-injects. Must not block: it runs on the worker.
pub type WriteBack = Arc<dyn Fn(Vec<u8>, IpFamily) + Send + Sync>;

const WORKER_QUEUE_DEPTH: usize = 1024;

struct Job {
    packet: Vec<u8>,
    family: IpFamily,
}

pub struct PacketPipeline {
    queues: Vec<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    write_back: WriteBack,
}

impl PacketPipeline {
    pub(crate) fn start(
        worker_count: usize,
        rules: Arc<ArcSwap<RuleSet>>,
        stats: Arc<StatsRegistry>,
        write_back: WriteBack,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let mut queues = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for _ in 0..worker_count {
            let (sender, mut receiver) = mpsc::channel::<Job>(WORKER_QUEUE_DEPTH);
            let rules = Arc::clone(&rules);
            let stats = Arc::clone(&stats);
            let write_back = Arc::clone(&write_back);

            workers.push(tokio::spawn(async move {
                while let Some(job) = receiver.recv().await {
                    let snapshot = rules.load();
                    let decision = classify(&job.packet, job.family, snapshot.domain_index());
                    match decision {
                        Decision::Forward => write_back(job.packet, job.family),
                        Decision::Drop => stats.record_blocked(0),
                    }
                }
            }));
            queues.push(sender);
        }

        Self {
            queues,
            workers,
            write_back,
        }
    }

    /// Hands one datagram to its flow's worker. When that worker's queue
    /// is full the packet is written back unfiltered: the pipeline fails
    /// open, never stalls the tunnel, and never reorders a flow by
    /// re-queueing elsewhere.
    pub fn submit(&self, packet: Vec<u8>, family: IpFamily) {
        let worker = (flow_hash(&packet, family) % self.queues.len() as u64) as usize;
        if let Err(error) = self.queues[worker].try_send(Job { packet, family }) {
            match error {
                mpsc::error::TrySendError::Full(job)
                | mpsc::error::TrySendError::Closed(job) => {
                    (self.write_back)(job.packet, job.family);
                }
            }
        }
    }

    /// Drains the queues and stops the workers.
    pub async fn shutdown(self) {
        drop(self.queues);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
