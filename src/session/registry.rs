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

use std::collections::{BTreeMap, HashMap};

use crate::quic::StreamId;
use crate::session::InnerStream;

/// 寻址一个流传输: 双向流与出向推送流用流编号,
/// 未绑定传输流的入向推送流只有push id可用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKey {
    Stream(StreamId),
    Push(u64),
}

/// pushId与streamId的双向一一映射
#[derive(Debug, Default)]
pub struct PushLookup {
    by_push: HashMap<u64, StreamId>,
    by_stream: HashMap<StreamId, u64>,
}

impl PushLookup {
    pub fn insert(&mut self, push_id: u64, stream_id: StreamId) -> bool {
        if self.by_push.contains_key(&push_id) || self.by_stream.contains_key(&stream_id) {
            return false;
        }
        self.by_push.insert(push_id, stream_id);
        self.by_stream.insert(stream_id, push_id);
        true
    }

    pub fn stream_by_push(&self, push_id: u64) -> Option<StreamId> {
        self.by_push.get(&push_id).copied()
    }

    pub fn push_by_stream(&self, stream_id: StreamId) -> Option<u64> {
        self.by_stream.get(&stream_id).copied()
    }

    pub fn remove_by_push(&mut self, push_id: u64) -> Option<StreamId> {
        let stream_id = self.by_push.remove(&push_id)?;
        self.by_stream.remove(&stream_id);
        Some(stream_id)
    }

    pub fn remove_by_stream(&mut self, stream_id: StreamId) -> Option<u64> {
        let push_id = self.by_stream.remove(&stream_id)?;
        self.by_push.remove(&push_id);
        Some(push_id)
    }

    pub fn len(&self) -> usize {
        self.by_push.len()
    }

    pub fn push_ids(&self) -> Vec<u64> {
        self.by_push.keys().copied().collect()
    }

    /// 校验两边互查一致
    pub fn is_consistent(&self) -> bool {
        self.by_push.len() == self.by_stream.len()
            && self.by_push.iter().all(|(push_id, stream_id)| {
                self.by_stream.get(stream_id) == Some(push_id)
            })
    }
}

/// 分类的流表, 查找顺序: 双向流, 出向推送流, 经映射表的入向推送流
pub struct StreamRegistry {
    pub streams: BTreeMap<StreamId, InnerStream>,
    pub ingress_push: BTreeMap<u64, InnerStream>,
    pub egress_push: BTreeMap<StreamId, InnerStream>,
    pub lookup: PushLookup,
}

impl StreamRegistry {
    pub fn new() -> Self {
        StreamRegistry {
            streams: BTreeMap::new(),
            ingress_push: BTreeMap::new(),
            egress_push: BTreeMap::new(),
            lookup: PushLookup::default(),
        }
    }

    pub fn get_mut(&mut self, key: StreamKey) -> Option<&mut InnerStream> {
        match key {
            StreamKey::Stream(id) => self.find_by_stream_id_mut(id),
            StreamKey::Push(push_id) => self.ingress_push.get_mut(&push_id),
        }
    }

    pub fn get(&self, key: StreamKey) -> Option<&InnerStream> {
        match key {
            StreamKey::Stream(id) => {
                if let Some(stream) = self.streams.get(&id) {
                    return Some(stream);
                }
                if let Some(stream) = self.egress_push.get(&id) {
                    return Some(stream);
                }
                let push_id = self.lookup.push_by_stream(id)?;
                self.ingress_push.get(&push_id)
            }
            StreamKey::Push(push_id) => self.ingress_push.get(&push_id),
        }
    }

    pub fn find_by_stream_id_mut(&mut self, id: StreamId) -> Option<&mut InnerStream> {
        if self.streams.contains_key(&id) {
            return self.streams.get_mut(&id);
        }
        if self.egress_push.contains_key(&id) {
            return self.egress_push.get_mut(&id);
        }
        let push_id = self.lookup.push_by_stream(id)?;
        self.ingress_push.get_mut(&push_id)
    }

    /// 流编号到寻址键, 入向推送流归一化为push id
    pub fn key_for_stream_id(&self, id: StreamId) -> Option<StreamKey> {
        if self.streams.contains_key(&id) {
            return Some(StreamKey::Stream(id));
        }
        if self.egress_push.contains_key(&id) {
            return Some(StreamKey::Stream(id));
        }
        let push_id = self.lookup.push_by_stream(id)?;
        if self.ingress_push.contains_key(&push_id) {
            Some(StreamKey::Push(push_id))
        } else {
            None
        }
    }

    pub fn contains(&self, key: StreamKey) -> bool {
        self.get(key).is_some()
    }

    pub fn number_of_streams(&self) -> usize {
        self.streams.len() + self.ingress_push.len() + self.egress_push.len()
    }

    pub fn number_of_ingress_streams(&self) -> usize {
        self.streams.len() + self.ingress_push.len()
    }

    pub fn number_of_egress_streams(&self) -> usize {
        self.streams.len() + self.egress_push.len()
    }

    pub fn number_of_ingress_push_streams(&self) -> usize {
        self.ingress_push.len()
    }

    pub fn number_of_egress_push_streams(&self) -> usize {
        self.egress_push.len()
    }

    /// 重入安全的遍历: 先拍快照, 回调里可以删流, 新增的流不会被本次访问
    pub fn collect_keys(&self) -> Vec<StreamKey> {
        let mut keys = Vec::with_capacity(self.number_of_streams());
        for id in self.streams.keys() {
            keys.push(StreamKey::Stream(*id));
        }
        for id in self.egress_push.keys() {
            keys.push(StreamKey::Stream(*id));
        }
        for push_id in self.ingress_push.keys() {
            keys.push(StreamKey::Push(*push_id));
        }
        keys
    }

    pub fn erase(&mut self, key: StreamKey) -> bool {
        match key {
            StreamKey::Stream(id) => self.erase_stream(id),
            StreamKey::Push(push_id) => self.erase_by_push_id(push_id),
        }
    }

    pub fn erase_stream(&mut self, id: StreamId) -> bool {
        let mut erased = self.streams.remove(&id).is_some();
        erased |= self.egress_push.remove(&id).is_some();
        if let Some(push_id) = self.lookup.remove_by_stream(id) {
            erased |= self.ingress_push.remove(&push_id).is_some();
        }
        erased
    }

    pub fn erase_by_push_id(&mut self, push_id: u64) -> bool {
        let erased = self.ingress_push.remove(&push_id).is_some();
        self.lookup.remove_by_push(push_id);
        erased
    }
}
