//! Pod log streaming across every pod an Application resource owns
//!
//! Each pod is read by its own task. Lines are parsed for their timestamp and
//! merged into one stream, buffered for a short window so that lines from
//! different pods come out in timestamp order.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use keel_common::resource_tree::{ApplicationTree, ResourceRef, POD_KIND};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::{Cluster, DownstreamClient, LogOptions};
use crate::error::{Error, Result};
use crate::request::PodLogsQuery;

/// Coalescing window for interleaving lines from several pods
pub const MERGE_WINDOW: Duration = Duration::from_millis(100);

const ENTRY_BUFFER: usize = 512;

/// One merged log line
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogEntry {
    /// Line content without the timestamp prefix
    pub content: String,
    /// Pod the line came from; empty on the final record
    pub pod_name: String,
    /// Time the line was written
    pub timestamp: Option<DateTime<Utc>>,
    /// Set on the final record only
    pub last: bool,
}

impl LogEntry {
    fn parse(pod_name: &str, line: &str) -> Self {
        let (timestamp, content) = match line.split_once(' ') {
            Some((ts, rest)) => match DateTime::parse_from_rfc3339(ts) {
                Ok(ts) => (Some(ts.with_timezone(&Utc)), rest),
                Err(_) => (None, line),
            },
            None => match DateTime::parse_from_rfc3339(line) {
                Ok(ts) => (Some(ts.with_timezone(&Utc)), ""),
                Err(_) => (None, line),
            },
        };
        Self {
            content: content.to_string(),
            pod_name: pod_name.to_string(),
            timestamp,
            last: false,
        }
    }

    fn terminal() -> Self {
        Self {
            timestamp: Some(Utc::now()),
            last: true,
            ..Default::default()
        }
    }
}

/// Substring filter; a leading `!` keeps lines that do *not* contain it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogFilter {
    literal: String,
    inverse: bool,
    match_case: bool,
}

impl LogFilter {
    /// Build a filter, `None` when no filter text was given
    pub fn parse(filter: Option<&str>, match_case: bool) -> Option<Self> {
        let filter = filter.filter(|f| !f.is_empty())?;
        let (literal, inverse) = match filter.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (filter, false),
        };
        Some(Self {
            literal: if match_case {
                literal.to_string()
            } else {
                literal.to_lowercase()
            },
            inverse,
            match_case,
        })
    }

    /// Whether the line passes the filter
    pub fn accepts(&self, line: &str) -> bool {
        let contains = if self.match_case {
            line.contains(&self.literal)
        } else {
            line.to_lowercase().contains(&self.literal)
        };
        contains != self.inverse
    }
}

/// Pods selected by the query: a single pod, or every pod owned by the
/// addressed resource.
pub fn select_pods(tree: &ApplicationTree, query: &PodLogsQuery) -> Vec<ResourceRef> {
    let selector = match &query.pod_name {
        Some(pod) => ResourceRef {
            kind: POD_KIND.to_string(),
            namespace: query.namespace.clone(),
            name: pod.clone(),
            ..Default::default()
        },
        None => ResourceRef {
            group: query.group.clone(),
            kind: query.kind.clone(),
            namespace: query.namespace.clone(),
            name: query.resource_name.clone(),
            ..Default::default()
        },
    };
    tree.pods_owned_by(Some(&selector))
        .into_iter()
        .map(|node| node.resource_ref.clone())
        .collect()
}

/// Opens and merges pod log streams
#[derive(Clone)]
pub struct PodLogStreamer {
    downstream: Arc<dyn DownstreamClient>,
    max_pods: usize,
}

impl PodLogStreamer {
    /// Create a streamer refusing requests for more than `max_pods` pods
    pub fn new(downstream: Arc<dyn DownstreamClient>, max_pods: usize) -> Self {
        Self {
            downstream,
            max_pods,
        }
    }

    /// Stream the merged logs of the selected pods.
    ///
    /// The stream ends with a record carrying `last = true` once every pod
    /// stream has finished. A read failure ends it with an error item
    /// instead. Cancellation ends it silently.
    pub fn open(
        &self,
        cluster: &Cluster,
        tree: &ApplicationTree,
        query: &PodLogsQuery,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<Result<LogEntry>>> {
        let pods = select_pods(tree, query);
        let (out_tx, out_rx) = mpsc::channel(ENTRY_BUFFER);
        if pods.is_empty() {
            return Ok(ReceiverStream::new(out_rx));
        }
        if pods.len() > self.max_pods {
            return Err(Error::invalid(
                "max pods to view logs are reached. Please provide more granular query",
            ));
        }

        let options = LogOptions {
            container: query.container.clone().filter(|c| !c.is_empty()),
            since_seconds: query.since_seconds.filter(|s| *s > 0),
            tail_lines: query.tail_lines.filter(|t| *t > 0),
            follow: query.follow,
            previous: query.previous,
        };
        let filter = LogFilter::parse(query.filter.as_deref(), query.match_case);

        let (entry_tx, entry_rx) = mpsc::channel(ENTRY_BUFFER);
        for pod in pods {
            tokio::spawn(read_pod(
                self.downstream.clone(),
                cluster.clone(),
                pod,
                options.clone(),
                entry_tx.clone(),
                cancel.child_token(),
            ));
        }
        drop(entry_tx);

        tokio::spawn(merge(entry_rx, out_tx, filter, cancel));
        Ok(ReceiverStream::new(out_rx))
    }
}

async fn read_pod(
    downstream: Arc<dyn DownstreamClient>,
    cluster: Cluster,
    pod: ResourceRef,
    options: LogOptions,
    tx: mpsc::Sender<Result<LogEntry>>,
    cancel: CancellationToken,
) {
    let mut lines = match downstream
        .pod_logs(&cluster, &pod.namespace, &pod.name, &options)
        .await
    {
        Ok(lines) => lines,
        Err(e) => {
            // usually the pod is not ready yet; show why instead of nothing
            let _ = tx
                .send(Ok(LogEntry {
                    content: e.to_string(),
                    pod_name: pod.name.clone(),
                    timestamp: Some(Utc::now()),
                    last: false,
                }))
                .await;
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = lines.next() => next,
        };
        let item = match next {
            None => return,
            Some(Ok(line)) => Ok(LogEntry::parse(&pod.name, &line)),
            Some(Err(e)) => Err(Error::upstream(format!("error reading logs of pod {}", pod.name), e)),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
}

async fn merge(
    mut rx: mpsc::Receiver<Result<LogEntry>>,
    tx: mpsc::Sender<Result<LogEntry>>,
    filter: Option<LogFilter>,
    cancel: CancellationToken,
) {
    let mut buffer: Vec<LogEntry> = Vec::new();
    let mut ticker = interval_at(Instant::now() + MERGE_WINDOW, MERGE_WINDOW);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("pod log stream cancelled");
                return;
            }
            _ = ticker.tick() => {
                if !flush(&mut buffer, &tx, filter.as_ref()).await {
                    return;
                }
            }
            item = rx.recv() => match item {
                Some(Ok(entry)) => buffer.push(entry),
                Some(Err(e)) => {
                    if flush(&mut buffer, &tx, filter.as_ref()).await {
                        let _ = tx.send(Err(e)).await;
                    }
                    return;
                }
                None => {
                    if flush(&mut buffer, &tx, filter.as_ref()).await {
                        let _ = tx.send(Ok(LogEntry::terminal())).await;
                    }
                    return;
                }
            }
        }
    }
}

/// Send buffered entries in timestamp order; false once the receiver is gone
async fn flush(
    buffer: &mut Vec<LogEntry>,
    tx: &mpsc::Sender<Result<LogEntry>>,
    filter: Option<&LogFilter>,
) -> bool {
    // stable: lines of one pod without timestamps keep their order
    buffer.sort_by_key(|e| e.timestamp);
    for entry in buffer.drain(..) {
        if filter.is_some_and(|f| !f.accepts(&entry.content)) {
            continue;
        }
        if tx.send(Ok(entry)).await.is_err() {
            return false;
        }
    }
    true
}
