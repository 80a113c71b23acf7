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

use std::collections::BTreeSet;

use crate::codec::decode_varint;
use crate::quic::StreamId;
use crate::session::{HqVersion, UniStreamType};

/// 前导分类结果, consumed是可以从流上消费掉的前导字节数
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchResult {
    /// 前导还没齐, 等更多数据
    NeedMore,
    Control(UniStreamType, usize),
    Push { push_id: u64, consumed: usize },
    Unknown { preface: u64 },
}

/// 对端新开的单向流在读出完整前导前由分发器临时接管.
/// 连接拆除时这里记录的待定流要统一清掉, 防止事后回调
#[derive(Debug, Default)]
pub struct UnidirDispatcher {
    pending: BTreeSet<StreamId>,
}

impl UnidirDispatcher {
    pub fn new() -> Self {
        UnidirDispatcher {
            pending: BTreeSet::new(),
        }
    }

    pub fn take_ownership(&mut self, id: StreamId) {
        self.pending.insert(id);
    }

    pub fn owns(&self, id: StreamId) -> bool {
        self.pending.contains(&id)
    }

    pub fn release(&mut self, id: StreamId) {
        self.pending.remove(&id);
    }

    pub fn pending_ids(&self) -> Vec<StreamId> {
        self.pending.iter().copied().collect()
    }

    pub fn clear(&mut self) -> Vec<StreamId> {
        let ids = self.pending_ids();
        self.pending.clear();
        ids
    }

    /// 只窥视不消费, 推送流要求前导后的push id也完整到达
    pub fn parse_preface(version: HqVersion, data: &[u8]) -> DispatchResult {
        let (preface, n) = match decode_varint(data) {
            Some(v) => v,
            None => return DispatchResult::NeedMore,
        };
        match version.parse_stream_preface(preface) {
            Some(UniStreamType::Push) => match decode_varint(&data[n..]) {
                Some((push_id, m)) => DispatchResult::Push {
                    push_id,
                    consumed: n + m,
                },
                None => DispatchResult::NeedMore,
            },
            Some(stream_type) => DispatchResult::Control(stream_type, n),
            None => DispatchResult::Unknown { preface },
        }
    }
}
