//! Node-State-Change Requests
//!
//! Any process may produce a request; only the supervisor consumes them.
//! Producers that are not the supervisor raise FAILOVER_INTERRUPT in the
//! signal slot and SIGUSR1 the supervisor after a successful enqueue.

use crate::cluster::{ClusterState, LockId, QueuedRequest};
use crate::config::MAX_BACKENDS;
use thiserror::Error;

// Request detail flags. These travel with the request through the ring.
/// Operator-initiated detach; unaffected workers may keep their sessions.
pub const REQ_SWITCHOVER: u8 = 0x01;
/// Producer is trusted; skip redundant state verification.
pub const REQ_CONFIRMED: u8 = 0x02;
/// Quarantine bookkeeping update, not a real failback.
pub const REQ_UPDATE: u8 = 0x04;
/// Originated from peer-cluster synchronization.
pub const REQ_WATCHDOG: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    NodeUp = 1,
    NodeDown = 2,
    Promote = 3,
    Quarantine = 4,
    CloseIdle = 5,
}

impl RequestKind {
    pub fn from_u8(v: u8) -> Option<RequestKind> {
        match v {
            1 => Some(RequestKind::NodeUp),
            2 => Some(RequestKind::NodeDown),
            3 => Some(RequestKind::Promote),
            4 => Some(RequestKind::Quarantine),
            5 => Some(RequestKind::CloseIdle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStateRequest {
    pub kind: RequestKind,
    pub node_ids: Vec<i32>,
    pub flags: u8,
}

impl NodeStateRequest {
    pub fn node_up(node_id: i32, flags: u8) -> NodeStateRequest {
        NodeStateRequest {
            kind: RequestKind::NodeUp,
            node_ids: vec![node_id],
            flags,
        }
    }

    pub fn node_down(node_ids: Vec<i32>, flags: u8) -> NodeStateRequest {
        NodeStateRequest {
            kind: RequestKind::NodeDown,
            node_ids,
            flags,
        }
    }

    pub fn promote(node_id: i32, flags: u8) -> NodeStateRequest {
        NodeStateRequest {
            kind: RequestKind::Promote,
            node_ids: vec![node_id],
            flags,
        }
    }

    pub fn quarantine(node_ids: Vec<i32>) -> NodeStateRequest {
        NodeStateRequest {
            kind: RequestKind::Quarantine,
            node_ids,
            flags: 0,
        }
    }

    pub fn close_idle() -> NodeStateRequest {
        NodeStateRequest {
            kind: RequestKind::CloseIdle,
            node_ids: vec![-1],
            flags: 0,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    fn to_entry(&self) -> QueuedRequest {
        let mut entry = QueuedRequest::empty();
        entry.kind = self.kind as u8;
        entry.flags = self.flags;
        let count = self.node_ids.len().min(MAX_BACKENDS);
        entry.count = count as u32;
        entry.node_ids[..count].copy_from_slice(&self.node_ids[..count]);
        entry
    }

    pub(crate) fn from_entry(entry: &QueuedRequest) -> Option<NodeStateRequest> {
        let kind = RequestKind::from_u8(entry.kind)?;
        let count = (entry.count as usize).min(MAX_BACKENDS);
        Some(NodeStateRequest {
            kind,
            node_ids: entry.node_ids[..count].to_vec(),
            flags: entry.flags,
        })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    /// Non-fatal; the producer decides whether to retry or drop.
    #[error("node state request queue is full")]
    QueueFull,
}

/// Enqueue a request. Returns whether a drain was already in progress at
/// insertion time, so the producer knows whether the supervisor must be
/// poked (or, for the supervisor itself, whether to drain inline).
pub fn push(cluster: &ClusterState, request: &NodeStateRequest) -> Result<bool, RequestError> {
    let info = cluster.request_info();

    // Cheap racy pre-check so producers back off without the semaphore.
    if info.queue_is_full() {
        return Err(RequestError::QueueFull);
    }

    let _guard = cluster.lock(LockId::RequestInfo);
    if info.queue_is_full() {
        return Err(RequestError::QueueFull);
    }
    info.queue_push(request.to_entry());
    Ok(info.switching())
}

/// Dequeue the oldest request. Supervisor-only.
pub fn pop(cluster: &ClusterState) -> Option<NodeStateRequest> {
    let _guard = cluster.lock(LockId::RequestInfo);
    cluster
        .request_info()
        .queue_pop()
        .as_ref()
        .and_then(NodeStateRequest::from_entry)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::test_config;
    use crate::cluster::{ClusterState, REQUEST_QUEUE_SIZE};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_push_pop_roundtrip() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        let request = NodeStateRequest::node_down(vec![1], REQ_SWITCHOVER);

        let in_progress = push(&cluster, &request).unwrap();
        assert!(!in_progress);

        let out = pop(&cluster).unwrap();
        assert_eq!(out, request);
        assert!(pop(&cluster).is_none());
    }

    #[test]
    fn test_full_queue_rejected_without_mutation() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        for _ in 0..REQUEST_QUEUE_SIZE {
            push(&cluster, &NodeStateRequest::close_idle()).unwrap();
        }
        let err = push(&cluster, &NodeStateRequest::close_idle()).unwrap_err();
        assert_eq!(err, RequestError::QueueFull);
        assert_eq!(cluster.request_info().queue_len(), REQUEST_QUEUE_SIZE);

        // Still drains fine afterwards.
        assert!(pop(&cluster).is_some());
        assert!(push(&cluster, &NodeStateRequest::close_idle()).is_ok());
    }

    #[test]
    fn test_push_reports_switching() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        cluster
            .request_info()
            .switching
            .store(true, Ordering::SeqCst);
        let in_progress = push(&cluster, &NodeStateRequest::node_up(0, 0)).unwrap();
        assert!(in_progress);
    }

    #[test]
    fn test_multi_node_request_preserved() {
        let cluster = ClusterState::create(&test_config(3)).unwrap();
        let request = NodeStateRequest::node_down(vec![0, 2], REQ_CONFIRMED);
        push(&cluster, &request).unwrap();
        let out = pop(&cluster).unwrap();
        assert_eq!(out.node_ids, vec![0, 2]);
        assert!(out.has_flag(REQ_CONFIRMED));
        assert!(!out.has_flag(REQ_UPDATE));
    }
}
