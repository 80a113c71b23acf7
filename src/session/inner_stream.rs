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

use tokio_util::time::delay_queue;
use webparse::{Binary, BinaryMut, Buf, BufMut};

use crate::codec::StreamCodec;
use crate::quic::StreamId;
use crate::session::StreamHandler;

/// 消息结束需要编解码器与传输层各确认一次, 两者齐了只触发一次
#[derive(Debug, Default)]
pub struct EomGate {
    codec: bool,
    transport: bool,
    fired: bool,
}

impl EomGate {
    /// 置位后两个条件都满足则返回true, 且只返回一次
    pub fn set_codec(&mut self) -> bool {
        self.codec = true;
        self.try_fire()
    }

    pub fn set_transport(&mut self) -> bool {
        self.transport = true;
        self.try_fire()
    }

    fn try_fire(&mut self) -> bool {
        if self.codec && self.transport && !self.fired {
            self.fired = true;
            true
        } else {
            false
        }
    }

    pub fn codec_seen(&self) -> bool {
        self.codec
    }

    pub fn transport_seen(&self) -> bool {
        self.transport
    }

    pub fn fired(&self) -> bool {
        self.fired
    }
}

/// 事务与流各自的入队状态是独立的:
/// 事务可因限速自己退出队列, 流可因流控被会话摘下, 四种组合都存在
#[derive(Debug, Default)]
pub struct QueueHandle {
    pub txn_enqueued: bool,
    pub transport_enqueued: bool,
}

/// 写到某个偏移后回调事务的字节事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteEvent {
    FirstHeaderByte,
    FirstBodyByte,
    LastByte,
}

/// 流的角色, 推送流与请求流共用同一个流传输结构
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Request,
    IngressPush { push_id: u64, parent: StreamId },
    EgressPush { push_id: u64 },
}

/// 单个事务的流传输状态: 缓冲/编解码器/门闩/计数器.
/// 擦除只发生在循环回调里, 并且要等所有门清空
pub struct InnerStream {
    pub kind: StreamKind,
    pub ingress_id: Option<StreamId>,
    pub egress_id: Option<StreamId>,

    pub read_buf: BinaryMut,
    pub write_buf: BinaryMut,
    pub codec: Option<Box<dyn StreamCodec>>,
    pub handler: Option<Box<dyn StreamHandler>>,

    pub queue_handle: QueueHandle,
    pub eom_gate: EomGate,

    pub pending_eom: bool,
    pub read_eof: bool,
    pub ingress_error: bool,
    pub detached: bool,
    pub errored: bool,

    pub bytes_written: u64,
    pub bytes_skipped: u64,
    pub active_delivery_callbacks: u64,
    pub pending_byte_events: u64,
    pub egress_headers_ack_offset: Option<u64>,

    /// PUSH_PROMISE头部到来前闩住的push id
    pub ingress_push_id: Option<u64>,

    pub ingress_started: bool,
    pub egress_headers_sent: bool,
    /// 事务已递交EOM(可能还没随FIN写出去)
    pub egress_complete: bool,
    pub first_header_byte_sent: bool,
    pub first_body_byte_sent: bool,
    pub goaway_notified: bool,
    pub detach_notified: bool,

    byte_events: Vec<(u64, ByteEvent)>,
    pub timeout_key: Option<delay_queue::Key>,
}

impl InnerStream {
    fn empty(kind: StreamKind) -> Self {
        InnerStream {
            kind,
            ingress_id: None,
            egress_id: None,
            read_buf: BinaryMut::new(),
            write_buf: BinaryMut::new(),
            codec: None,
            handler: None,
            queue_handle: QueueHandle::default(),
            eom_gate: EomGate::default(),
            pending_eom: false,
            read_eof: false,
            ingress_error: false,
            detached: false,
            errored: false,
            bytes_written: 0,
            bytes_skipped: 0,
            active_delivery_callbacks: 0,
            pending_byte_events: 0,
            egress_headers_ack_offset: None,
            ingress_push_id: None,
            ingress_started: false,
            egress_headers_sent: false,
            egress_complete: false,
            first_header_byte_sent: false,
            first_body_byte_sent: false,
            goaway_notified: false,
            detach_notified: false,
            byte_events: Vec::new(),
            timeout_key: None,
        }
    }

    pub fn new_request(id: StreamId, codec: Box<dyn StreamCodec>) -> Self {
        let mut stream = Self::empty(StreamKind::Request);
        stream.ingress_id = Some(id);
        stream.egress_id = Some(id);
        stream.codec = Some(codec);
        stream
    }

    /// 入向推送流先以push id存在, 对应的传输流稍后才绑定
    pub fn new_ingress_push(push_id: u64, parent: StreamId) -> Self {
        Self::empty(StreamKind::IngressPush { push_id, parent })
    }

    pub fn new_egress_push(id: StreamId, push_id: u64, codec: Box<dyn StreamCodec>) -> Self {
        let mut stream = Self::empty(StreamKind::EgressPush { push_id });
        stream.egress_id = Some(id);
        stream.codec = Some(codec);
        stream
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.egress_id.or(self.ingress_id)
    }

    pub fn push_id(&self) -> Option<u64> {
        match self.kind {
            StreamKind::Request => None,
            StreamKind::IngressPush { push_id, .. } => Some(push_id),
            StreamKind::EgressPush { push_id } => Some(push_id),
        }
    }

    pub fn is_using(&self, id: StreamId) -> bool {
        self.ingress_id == Some(id) || self.egress_id == Some(id)
    }

    /// 已提交到传输层的字节数, 含被跳过的
    pub fn stream_egress_committed_offset(&self) -> u64 {
        self.bytes_written + self.bytes_skipped
    }

    /// 含本地还在缓冲里的字节
    pub fn stream_write_offset(&self) -> u64 {
        self.stream_egress_committed_offset() + self.write_buf.remaining() as u64
    }

    pub fn has_pending_body(&self) -> bool {
        self.write_buf.remaining() != 0
    }

    pub fn has_pending_eom(&self) -> bool {
        self.pending_eom
    }

    pub fn has_pending_egress(&self) -> bool {
        self.write_buf.remaining() > 0 || self.pending_eom || self.queue_handle.txn_enqueued
    }

    /// 是否值得回调事务补充写缓冲
    pub fn wants_on_write_ready(&self, can_send: u64) -> bool {
        self.queue_handle.txn_enqueued
            && !self.egress_complete
            && can_send > self.write_buf.remaining() as u64
    }

    pub fn arm_byte_event(&mut self, offset: u64, event: ByteEvent) {
        self.byte_events.push((offset, event));
    }

    /// 提交偏移越过的事件按登记顺序弹出
    pub fn take_fired_byte_events(&mut self, committed: u64) -> Vec<ByteEvent> {
        let mut fired = Vec::new();
        self.byte_events.retain(|(offset, ev)| {
            if *offset <= committed {
                fired.push(*ev);
                false
            } else {
                true
            }
        });
        fired
    }

    pub fn drain_byte_events(&mut self) {
        self.byte_events.clear();
    }

    /// 入向中止: 丢弃未解析数据并暂停解析器
    pub fn abort_ingress(&mut self) {
        self.ingress_error = true;
        self.read_buf = BinaryMut::new();
        self.read_eof = false;
        if let Some(codec) = &mut self.codec {
            codec.set_parser_paused(true);
        }
    }

    /// 出向中止: 丢弃缓冲与字节事件
    pub fn abort_egress(&mut self) {
        self.drain_byte_events();
        self.write_buf = BinaryMut::new();
        self.pending_eom = false;
        self.egress_complete = true;
        self.queue_handle.txn_enqueued = false;
    }

    /// 事务两个方向都结束且没有任何字节事件挂着
    pub fn is_detach_ready(&self) -> bool {
        let ingress_done = self.eom_gate.fired() || self.ingress_error || self.errored;
        let egress_done = (self.egress_complete && !self.pending_eom) || self.errored;
        ingress_done && egress_done && self.pending_byte_events == 0
    }

    /// 擦除门: 已脱离且缓冲清空, 没有写挂起也没有送达回调在途
    pub fn is_erasable(&self) -> bool {
        self.detached
            && self.read_buf.remaining() == 0
            && self.write_buf.remaining() == 0
            && !self.pending_eom
            && !self.queue_handle.transport_enqueued
            && self.active_delivery_callbacks == 0
    }

    pub fn append_read(&mut self, data: Binary, eof: bool) {
        if data.remaining() > 0 {
            self.read_buf.put_slice(data.chunk());
        }
        if eof {
            self.read_eof = true;
        }
    }

    /// 把传输层退回来的数据放回缓冲头部
    pub fn unshift_write(&mut self, data: Binary) {
        if data.remaining() == 0 {
            return;
        }
        let mut merged = BinaryMut::new();
        merged.put_slice(data.chunk());
        merged.put_slice(self.write_buf.chunk());
        self.write_buf = merged;
    }

    /// 部分可靠: 丢弃尚未提交的某个流偏移之前的出向数据
    pub fn trim_pending_egress(&mut self, wire_offset: u64) -> u64 {
        let committed = self.stream_egress_committed_offset();
        if committed > wire_offset {
            return 0;
        }
        let trim = (wire_offset - committed).min(self.write_buf.remaining() as u64);
        if trim > 0 {
            self.write_buf.advance(trim as usize);
        }
        trim
    }
}
