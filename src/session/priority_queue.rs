// Copyright 2023 - 2024 Wmquic See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2023/11/24 09:21:05

use std::cmp::Ordering;
use std::collections::HashMap;

use rbtree::RBTree;

use crate::quic::StreamId;

/// 默认权重, 对端未宣告优先级时使用
const DEFAULT_WEIGHT: u8 = 16;

/// 按(权重降序, 入队次序)排序的键
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityNode {
    pub weight: u8,
    pub seq: u64,
    pub stream_id: StreamId,
}

impl Ord for PriorityNode {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .weight
            .cmp(&self.weight)
            .then(self.seq.cmp(&other.seq))
            .then(self.stream_id.cmp(&other.stream_id))
    }
}

impl PartialOrd for PriorityNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 出队顺序由依赖/权重树决定, 同权重按入队次序
#[derive(Debug)]
pub struct PriorityQueue {
    send_queue: RBTree<PriorityNode, ()>,
    hash_weight: HashMap<StreamId, u8>,
    hash_depend: HashMap<StreamId, StreamId>,
    enqueued: HashMap<StreamId, PriorityNode>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        PriorityQueue {
            send_queue: RBTree::new(),
            hash_weight: HashMap::new(),
            hash_depend: HashMap::new(),
            enqueued: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.send_queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.send_queue.len()
    }

    /// 对端的优先级宣告, 依赖方的权重不小于被依赖方
    pub fn priority_recv(&mut self, id: StreamId, depend_id: StreamId, weight: u8) {
        self.hash_weight.insert(id, weight);
        if depend_id != 0 {
            self.hash_depend.insert(id, depend_id);
            let next = std::cmp::min(weight.wrapping_add(1), 255);
            self.hash_weight
                .entry(depend_id)
                .and_modify(|v| *v = std::cmp::max(*v, next))
                .or_insert(next);
        }
        // 已入队的重新按新权重排队
        if let Some(node) = self.enqueued.remove(&id) {
            self.send_queue.remove(&node);
            self.signal_pending_egress(id);
        }
    }

    pub fn weight(&self, stream_id: &StreamId) -> u8 {
        if self.hash_weight.contains_key(stream_id) {
            self.hash_weight[stream_id]
        } else {
            DEFAULT_WEIGHT
        }
    }

    pub fn is_enqueued(&self, id: StreamId) -> bool {
        self.enqueued.contains_key(&id)
    }

    pub fn signal_pending_egress(&mut self, id: StreamId) {
        if self.enqueued.contains_key(&id) {
            return;
        }
        let node = PriorityNode {
            weight: self.weight(&id),
            seq: self.next_seq,
            stream_id: id,
        };
        self.next_seq += 1;
        self.send_queue.insert(node, ());
        self.enqueued.insert(id, node);
    }

    pub fn clear_pending_egress(&mut self, id: StreamId) {
        if let Some(node) = self.enqueued.remove(&id) {
            self.send_queue.remove(&node);
        }
    }

    /// 本轮按优先顺序应服务的流与各自的份额
    pub fn next_egress(&self) -> Vec<(StreamId, f64)> {
        let mut total = 0u64;
        for (node, _) in self.send_queue.iter() {
            total += node.weight as u64;
        }
        let mut result = Vec::with_capacity(self.send_queue.len());
        for (node, _) in self.send_queue.iter() {
            let ratio = if total == 0 {
                1.0
            } else {
                node.weight as f64 / total as f64
            };
            result.push((node.stream_id, ratio));
        }
        result
    }
}
