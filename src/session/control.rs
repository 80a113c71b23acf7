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
// Created Date: 2023/11/27 10:02:41

use std::collections::{BTreeMap, BTreeSet};
use std::task::{Context, Poll};

use tokio_util::time::DelayQueue;
use webparse::{Binary, BinaryMut, Buf, BufMut, HeaderMap};

use crate::codec::{
    CodecEvent, ControlCodec, ControlEvent, H1Codec, HqSettings, HqStreamCodec, Message,
    SharedQpack, StreamCodec,
};
use crate::quic::{self, LocalErrorCode, QuicErrorCode, QuicEvent, QuicSocket, StreamId};
use crate::session::{
    ByteEvent, Builder, ControlStream, Direction, DispatchResult, DrainState, FlowControl,
    HqVersion, InnerStream, PriorityQueue, SessionController, StateDrain, StateSettings,
    StreamHandler, StreamKey, StreamKind, StreamRegistry, Txn, UnidirDispatcher, UniStreamType,
};
use crate::{Consts, ErrorKind, Http3ErrorCode, ProtError, ProtResult};

/// 会话引擎: 流表/调度/排空/错误策略都在这里.
/// 套接字不归引擎所有, 每次调用由连接层借进来, 流状态与传输调用互不纠缠
pub struct Control {
    direction: Direction,
    version: Option<HqVersion>,
    alpn: String,
    qpack: Option<SharedQpack>,

    registry: StreamRegistry,
    control_streams: BTreeMap<UniStreamType, ControlStream>,
    dispatcher: UnidirDispatcher,
    egress_queue: PriorityQueue,

    drain: StateDrain,
    settings: StateSettings,
    config: Builder,

    pending_read_set: BTreeSet<StreamId>,
    /// 单轮读上限之外延后到循环里再读的流
    deferred_reads: BTreeSet<StreamId>,
    reads_per_loop: usize,

    scheduled_write: bool,
    conn_flow: FlowControl,

    max_incoming_stream_id: StreamId,
    max_allowed_stream_id: StreamId,
    next_push_id: u64,

    drop_in_next_loop: Option<(Http3ErrorCode, String, ErrorKind)>,
    dropping: bool,
    started: bool,
    destroyed: bool,
    received_settings: bool,

    timeouts: DelayQueue<StreamKey>,
    controller: Option<Box<dyn SessionController>>,

    span: tracing::Span,
}

impl Control {
    pub fn new(
        direction: Direction,
        config: Builder,
        controller: Box<dyn SessionController>,
    ) -> Self {
        let settings = StateSettings::new(config.settings.clone());
        Control {
            direction,
            version: None,
            alpn: String::new(),
            qpack: None,
            registry: StreamRegistry::new(),
            control_streams: BTreeMap::new(),
            dispatcher: UnidirDispatcher::new(),
            egress_queue: PriorityQueue::new(),
            drain: StateDrain::new(),
            settings,
            config,
            pending_read_set: BTreeSet::new(),
            deferred_reads: BTreeSet::new(),
            reads_per_loop: 0,
            scheduled_write: false,
            conn_flow: FlowControl::new(),
            max_incoming_stream_id: 0,
            max_allowed_stream_id: Consts::EIGHT_BYTE_LIMIT,
            next_push_id: 0,
            drop_in_next_loop: None,
            dropping: false,
            started: false,
            destroyed: false,
            received_settings: false,
            timeouts: DelayQueue::new(),
            controller: Some(controller),
            span: tracing::trace_span!("hq_session"),
        }
    }

    // ------------------------------------------------------------------
    // 基本信息

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn version(&self) -> Option<HqVersion> {
        self.version
    }

    pub fn alpn(&self) -> &str {
        &self.alpn
    }

    pub fn drain_state(&self) -> DrainState {
        self.drain.state()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_closing(&self) -> bool {
        !self.drain.is_none() || self.dropping
    }

    pub fn number_of_streams(&self) -> usize {
        self.registry.number_of_streams()
    }

    pub fn number_of_ingress_streams(&self) -> usize {
        self.registry.number_of_ingress_streams()
    }

    pub fn number_of_egress_streams(&self) -> usize {
        self.registry.number_of_egress_streams()
    }

    pub fn number_of_ingress_push_streams(&self) -> usize {
        self.registry.number_of_ingress_push_streams()
    }

    pub fn number_of_egress_push_streams(&self) -> usize {
        self.registry.number_of_egress_push_streams()
    }

    /// 对端的优先级宣告, 改写依赖树并让已入队的流重新排队
    pub fn update_priority(&mut self, id: StreamId, depend_id: StreamId, weight: u8) {
        self.egress_queue.priority_recv(id, depend_id, weight);
    }

    pub fn received_settings(&self) -> bool {
        self.received_settings
    }

    pub fn qpack(&self) -> Option<&SharedQpack> {
        self.qpack.as_ref()
    }

    pub fn stream_id_of(&self, key: StreamKey) -> Option<StreamId> {
        self.registry.get(key).and_then(|s| s.stream_id())
    }

    pub fn contains_transaction(&self, key: StreamKey) -> bool {
        self.registry.contains(key)
    }

    pub fn mark_started(&mut self) {
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    // ------------------------------------------------------------------
    // 事件入口

    pub fn on_event(&mut self, sock: &mut dyn QuicSocket, event: QuicEvent) {
        if self.destroyed || self.dropping {
            return;
        }
        let result = self.dispatch_event(sock, event);
        if let Err(err) = result {
            self.latch_error(err);
        }
    }

    fn dispatch_event(&mut self, sock: &mut dyn QuicSocket, event: QuicEvent) -> ProtResult<()> {
        match event {
            QuicEvent::TransportReady => self.on_transport_ready(sock),
            QuicEvent::ReplaySafe => {
                tracing::trace!(parent: &self.span, "replay safe");
                Ok(())
            }
            QuicEvent::NewBidirectionalStream(id) => self.on_new_bidirectional_stream(sock, id),
            QuicEvent::NewUnidirectionalStream(id) => self.on_new_unidirectional_stream(sock, id),
            QuicEvent::ReadAvailable(id) => self.on_read_available(sock, id),
            QuicEvent::ReadError(id, err) => self.on_read_error(sock, id, err),
            QuicEvent::FlowControlUpdate(id) => {
                self.on_flow_control_update(sock, id);
                Ok(())
            }
            QuicEvent::ConnectionWriteReady(max) => {
                self.scheduled_write = false;
                self.conn_flow.replenish(max);
                Ok(())
            }
            QuicEvent::ConnectionWriteError(_err) => {
                // 随后大概率会有连接错误事件, 这里不动作
                self.scheduled_write = false;
                Ok(())
            }
            QuicEvent::StopSending(id, code) => {
                if let Some(key) = self.registry.key_for_stream_id(id) {
                    self.handle_write_error(sock, key, QuicErrorCode::Application(code));
                }
                Ok(())
            }
            QuicEvent::ConnectionEnd => {
                // 传输层不会在close()之后再报onConnectionEnd, 无需防重入
                self.drain.set(DrainState::Done);
                self.close_when_idle(sock);
                Ok(())
            }
            QuicEvent::ConnectionError(code, msg) => {
                self.on_connection_error(sock, code, msg);
                Ok(())
            }
            QuicEvent::DeliveryAck { stream_id, offset } => {
                self.on_delivery_ack(sock, stream_id, offset);
                Ok(())
            }
            QuicEvent::DeliveryCanceled { stream_id, offset } => {
                self.on_delivery_canceled(sock, stream_id, offset);
                Ok(())
            }
            QuicEvent::DataExpired { stream_id, offset } => {
                self.on_data_expired(sock, stream_id, offset);
                Ok(())
            }
            QuicEvent::DataRejected { stream_id, offset } => {
                self.on_data_rejected(sock, stream_id, offset);
                Ok(())
            }
        }
    }

    /// 连接级错误不当场拆会话, 闩住等下一轮循环
    fn latch_error(&mut self, err: ProtError) {
        let (kind, code, msg) = match err {
            ProtError::Connection { kind, code, msg } => (kind, code, msg),
            ProtError::Stream { kind, code, msg } => (kind, code, msg),
            other => (
                ErrorKind::Connection,
                Http3ErrorCode::InternalError,
                format!("{}", other),
            ),
        };
        if self.drop_in_next_loop.is_none() {
            self.drop_in_next_loop = Some((code, msg, kind));
        } else {
            tracing::trace!(parent: &self.span, "session already scheduled to be dropped");
        }
    }

    // ------------------------------------------------------------------
    // 启动

    fn on_transport_ready(&mut self, sock: &mut dyn QuicSocket) -> ProtResult<()> {
        let alpn = sock.app_protocol();
        let version = alpn.as_deref().and_then(HqVersion::from_alpn);
        let version = match version {
            Some(v) => v,
            None => {
                tracing::error!(parent: &self.span, alpn = ?alpn, "next protocol not supported");
                self.on_connection_error(
                    sock,
                    QuicErrorCode::Local(LocalErrorCode::ConnectFailed),
                    "ALPN not supported".to_string(),
                );
                return Ok(());
            }
        };
        self.alpn = alpn.unwrap_or_default();
        self.version = Some(version);
        if version.uses_qpack() {
            self.qpack = Some(crate::codec::shared_qpack());
        }
        if let Some(window) = self.config.receive_session_window {
            sock.set_connection_flow_control_window(window);
        }

        for stream_type in version.egress_control_streams() {
            let id = sock.create_unidirectional_stream().map_err(|_| {
                ProtError::connection_kind(
                    ErrorKind::Connect,
                    Http3ErrorCode::InternalError,
                    "failed to create unidirectional stream",
                )
            })?;
            let ctrl = ControlStream::new(*stream_type, id);
            sock.set_control_stream(id)?;
            self.control_streams.insert(*stream_type, ctrl);
        }
        if version.sends_settings() {
            self.send_settings(sock)?;
        }
        // 排空请求可能比传输就绪先到, 在这里补发GOAWAY
        if self.drain.state() == DrainState::Pending {
            self.send_goaway(sock);
        }
        if !self.control_streams.is_empty() {
            self.schedule_write(sock);
        }
        Ok(())
    }

    pub fn send_settings(&mut self, sock: &mut dyn QuicSocket) -> ProtResult<usize> {
        let version = match self.version {
            Some(v) if v.sends_settings() => v,
            _ => return Ok(0),
        };
        debug_assert!(version == HqVersion::Hq);
        let egress = self.settings.egress().clone();
        if let Some(qpack) = &self.qpack {
            if let Ok(mut qpack) = qpack.write() {
                // 本端接收能力决定解码侧的参数
                qpack.set_max_blocking(egress.qpack_blocked_streams);
            }
        }
        let ctrl = match self.control_streams.get_mut(&UniStreamType::Control) {
            Some(ctrl) => ctrl,
            None => return Ok(0),
        };
        let generated = match &mut ctrl.egress_codec {
            Some(codec) => codec.generate_settings(&mut ctrl.write_buf, &egress)?,
            None => 0,
        };
        self.settings.mark_sent();
        self.schedule_write(sock);
        Ok(generated)
    }

    pub fn set_egress_settings(&mut self, settings: HqSettings) {
        self.settings.set_egress(settings);
    }

    pub fn set_flow_control(
        &mut self,
        sock: &mut dyn QuicSocket,
        stream_window: u64,
        session_window: u64,
    ) {
        sock.set_connection_flow_control_window(session_window);
        self.config.receive_stream_window = Some(stream_window);
    }

    pub fn send_ping(&mut self, sock: &mut dyn QuicSocket) {
        sock.send_ping();
    }

    // ------------------------------------------------------------------
    // 新流准入

    fn check_new_stream(&mut self, sock: &mut dyn QuicSocket, id: StreamId) -> bool {
        // 服务端不会主动开双向流, 对端是谁都一样
        if quic::is_bidirectional(id) && quic::is_server_initiated(id) {
            self.abort_both_directions(sock, id, Http3ErrorCode::WrongStream);
            return false;
        }
        if !self.drain.is_none() {
            // 乱序到达允许对端在排空后开编号更小的流
            let over_limit = match self.direction {
                Direction::Upstream => id > self.max_allowed_stream_id,
                Direction::Downstream => {
                    quic::is_bidirectional(id) && id > self.max_incoming_stream_id
                }
            };
            if over_limit {
                self.abort_both_directions(sock, id, Http3ErrorCode::RequestRejected);
                return false;
            }
        }
        true
    }

    fn on_new_bidirectional_stream(
        &mut self,
        sock: &mut dyn QuicSocket,
        id: StreamId,
    ) -> ProtResult<()> {
        tracing::trace!(parent: &self.span, stream_id = id, "new bidirectional stream");
        debug_assert!(self.version.is_some(), "stream before transport ready");
        if !self.check_new_stream(sock, id) {
            return Ok(());
        }
        if self.create_stream_transport(sock, id)? {
            self.max_incoming_stream_id = self.max_incoming_stream_id.max(id);
        }
        Ok(())
    }

    fn on_new_unidirectional_stream(
        &mut self,
        sock: &mut dyn QuicSocket,
        id: StreamId,
    ) -> ProtResult<()> {
        tracing::trace!(parent: &self.span, stream_id = id, "new unidirectional stream");
        let version = match self.version {
            Some(v) => v,
            None => return Ok(()),
        };
        if version == HqVersion::H1qV1 {
            // V1没有任何单向流
            let _ = sock.stop_sending(id, Http3ErrorCode::WrongStream);
            return Ok(());
        }
        // 类型还得等前导字节, 先交给分发器
        self.dispatcher.take_ownership(id);
        Ok(())
    }

    /// 关闭中的会话与重复的流编号拒绝建流, 返回是否建立
    fn create_stream_transport(
        &mut self,
        sock: &mut dyn QuicSocket,
        id: StreamId,
    ) -> ProtResult<bool> {
        if !sock.good() || self.registry.key_for_stream_id(id).is_some() {
            return Ok(false);
        }
        let codec = self.make_stream_codec(id);
        let mut stream = InnerStream::new_request(id, codec);
        if let Some(window) = self.config.receive_stream_window {
            sock.set_stream_flow_control_window(id, window);
        }
        if !self.drain.is_none() && self.version == Some(HqVersion::H1qV1) {
            if let Some(codec) = &mut stream.codec {
                let _ = codec.generate_goaway(&mut stream.write_buf);
            }
        }
        self.registry.streams.insert(id, stream);
        self.arm_timeout(StreamKey::Stream(id));
        Ok(true)
    }

    fn make_stream_codec(&self, id: StreamId) -> Box<dyn StreamCodec> {
        let decode_request = self.direction.is_downstream();
        match self.version {
            Some(HqVersion::Hq) => Box::new(HqStreamCodec::new(
                id,
                decode_request,
                self.qpack.as_ref().expect("qpack bound with HQ").clone(),
            )),
            _ => Box::new(H1Codec::new(decode_request)),
        }
    }

    /// 本端发起新事务, 排空中或套接字坏掉则拒绝
    pub fn new_transaction(
        &mut self,
        sock: &mut dyn QuicSocket,
        handler: Box<dyn StreamHandler>,
    ) -> ProtResult<Option<StreamId>> {
        if self.drain.refuses_new_transactions() || self.dropping {
            tracing::trace!(parent: &self.span, "new transaction after drain");
            return Ok(None);
        }
        if !sock.good() {
            return Ok(None);
        }
        let id = match sock.create_bidirectional_stream() {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };
        if !self.create_stream_transport(sock, id)? {
            return Ok(None);
        }
        if let Some(stream) = self.registry.streams.get_mut(&id) {
            stream.handler = Some(handler);
        }
        Ok(Some(id))
    }

    // ------------------------------------------------------------------
    // 读路径

    fn on_read_available(&mut self, sock: &mut dyn QuicSocket, id: StreamId) -> ProtResult<()> {
        if self.dispatcher.owns(id) {
            return self.dispatch_unidirectional(sock, id);
        }
        if self.find_control_by_ingress(id).is_some() {
            return self.read_control_stream(sock, id);
        }
        if self.reads_per_loop >= Consts::MAX_READS_PER_LOOP {
            self.deferred_reads.insert(id);
            return Ok(());
        }
        self.reads_per_loop += 1;
        self.read_request_stream(sock, id)
    }

    fn read_request_stream(&mut self, sock: &mut dyn QuicSocket, id: StreamId) -> ProtResult<()> {
        let key = match self.registry.key_for_stream_id(id) {
            Some(key) => key,
            None => return Ok(()),
        };
        let stream = match self.registry.get_mut(key) {
            Some(s) if !s.detached => s,
            _ => return Ok(()),
        };
        let (data, eof) = match sock.read(id, 0) {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(parent: &self.span, stream_id = id, "sync read error");
                let _ = err;
                return self.on_read_error(
                    sock,
                    id,
                    QuicErrorCode::Local(LocalErrorCode::InternalError),
                );
            }
        };
        stream.append_read(data, eof);
        self.reset_timeout(key);
        // 先缓冲, 循环回调里统一喂编解码器
        self.pending_read_set.insert(id);
        Ok(())
    }

    fn find_control_by_ingress(&self, id: StreamId) -> Option<UniStreamType> {
        self.control_streams
            .iter()
            .find(|(_, ctrl)| ctrl.ingress_id == Some(id))
            .map(|(t, _)| *t)
    }

    fn find_control_by_egress(&self, id: StreamId) -> Option<UniStreamType> {
        self.control_streams
            .iter()
            .find(|(_, ctrl)| ctrl.egress_id == id)
            .map(|(t, _)| *t)
    }

    fn read_control_stream(&mut self, sock: &mut dyn QuicSocket, id: StreamId) -> ProtResult<()> {
        let stream_type = match self.find_control_by_ingress(id) {
            Some(t) => t,
            None => return Ok(()),
        };
        let (data, eof) = sock.read(id, 0)?;
        let ctrl = self.control_streams.get_mut(&stream_type).unwrap();
        if data.remaining() > 0 {
            ctrl.read_buf.put_slice(data.chunk());
        }
        ctrl.read_eof |= eof;
        self.process_control_read(sock, stream_type)
    }

    fn process_control_read(
        &mut self,
        sock: &mut dyn QuicSocket,
        stream_type: UniStreamType,
    ) -> ProtResult<()> {
        let result = self.process_control_read_inner(sock, stream_type);
        if let Err(err) = result {
            self.handle_session_error_prot(stream_type, err);
        }
        Ok(())
    }

    fn process_control_read_inner(
        &mut self,
        sock: &mut dyn QuicSocket,
        stream_type: UniStreamType,
    ) -> ProtResult<()> {
        let ctrl = match self.control_streams.get_mut(&stream_type) {
            Some(ctrl) => ctrl,
            None => return Ok(()),
        };
        let mut events = Vec::new();
        let data = ctrl.read_buf.chunk().to_vec();
        let read_eof = ctrl.read_eof;
        let consumed = match stream_type {
            UniStreamType::Control => match &mut ctrl.ingress_codec {
                Some(codec) => codec.on_ingress(&data, &mut events)?,
                None => 0,
            },
            UniStreamType::QpackEncoder | UniStreamType::QpackDecoder => {
                let qpack = self
                    .qpack
                    .as_ref()
                    .ok_or(ProtError::Extension("qpack not bound"))?;
                let mut qpack = qpack
                    .write()
                    .map_err(|_| ProtError::Extension("qpack lock poisoned"))?;
                if stream_type == UniStreamType::QpackEncoder {
                    // 对端编码器的指令, 喂本端解码侧
                    qpack.on_encoder_instructions(&data)?;
                } else {
                    qpack.on_decoder_instructions(&data)?;
                }
                data.len()
            }
            UniStreamType::Push => 0,
        };
        let ctrl = self.control_streams.get_mut(&stream_type).unwrap();
        if consumed > 0 {
            ctrl.read_buf.advance(consumed);
        }
        if read_eof && ctrl.read_buf.remaining() == 0 {
            // 控制流上的EOF视为关键流关闭
            return Err(ProtError::connection(
                Http3ErrorCode::ClosedCriticalStream,
                "control stream closed",
            ));
        }
        for event in events {
            match event {
                ControlEvent::Settings(settings) => self.on_settings(settings),
                ControlEvent::Goaway { max_stream_id } => self.on_goaway(sock, max_stream_id),
            }
        }
        Ok(())
    }

    fn on_settings(&mut self, settings: HqSettings) {
        tracing::trace!(parent: &self.span, "got SETTINGS");
        if let Some(qpack) = &self.qpack {
            if let Ok(mut qpack) = qpack.write() {
                qpack.set_encoder_table_capacity(settings.header_table_size);
            }
        }
        self.settings.recv_settings(settings);
        self.received_settings = true;
    }

    /// 对端宣告排空. 同一个上限重复到达是无害的
    fn on_goaway(&mut self, sock: &mut dyn QuicSocket, max_stream_id: u64) {
        tracing::trace!(parent: &self.span, max_stream_id, "got GOAWAY");
        self.max_allowed_stream_id = self.max_allowed_stream_id.min(max_stream_id);
        self.drain_impl(sock);

        let local_initiated_bit = self.direction.is_upstream();
        for key in self.registry.collect_keys() {
            let (notify, over_limit) = match self.registry.get_mut(key) {
                Some(stream) if !stream.detached => {
                    let notify = !stream.goaway_notified;
                    stream.goaway_notified = true;
                    let over_limit = match (stream.kind, stream.stream_id()) {
                        (StreamKind::Request, Some(id)) => {
                            quic::is_client_initiated(id) == local_initiated_bit
                                && id > self.max_allowed_stream_id
                        }
                        _ => false,
                    };
                    (notify, over_limit)
                }
                _ => continue,
            };
            if notify {
                self.with_handler(sock, key, |handler, _txn| handler.on_goaway());
            }
            if over_limit {
                // 对端没处理过这个流, 打上可重试标记
                let err = ProtError::stream_unacked(
                    Http3ErrorCode::RequestRejected,
                    "goaway: stream unacknowledged by peer",
                );
                self.error_on_transaction(sock, key, err);
            }
        }

        match self.drain.state() {
            DrainState::None | DrainState::Pending => self.drain.set(DrainState::FirstGoaway),
            DrainState::FirstGoaway => self.drain.set(DrainState::Done),
            _ => {}
        }
        self.check_for_shutdown(sock);
    }

    // ------------------------------------------------------------------
    // 单向流分发

    fn dispatch_unidirectional(
        &mut self,
        sock: &mut dyn QuicSocket,
        id: StreamId,
    ) -> ProtResult<()> {
        let version = match self.version {
            Some(v) => v,
            None => return Ok(()),
        };
        let (data, eof) = sock.peek(id)?;
        match UnidirDispatcher::parse_preface(version, data.chunk()) {
            DispatchResult::NeedMore => {
                if eof {
                    self.dispatcher.release(id);
                }
                Ok(())
            }
            DispatchResult::Control(stream_type, consumed) => {
                sock.consume(id, consumed)?;
                self.dispatcher.release(id);
                self.bind_ingress_control_stream(sock, id, stream_type)
            }
            DispatchResult::Push { push_id, consumed } => {
                if self.direction.is_downstream() {
                    // 只有服务端能推送
                    self.dispatcher.release(id);
                    let _ = sock.stop_sending(id, Http3ErrorCode::WrongStream);
                    return Ok(());
                }
                sock.consume(id, consumed)?;
                self.dispatcher.release(id);
                if !self.registry.lookup.insert(push_id, id) {
                    return Err(ProtError::connection(
                        Http3ErrorCode::GeneralProtocolError,
                        "duplicate push id on new push stream",
                    ));
                }
                tracing::trace!(parent: &self.span, push_id, stream_id = id, "nascent push stream");
                // 绑定前先停住, 免得数据没人收
                sock.pause_read(id);
                self.try_bind_ingress_push(sock, push_id);
                Ok(())
            }
            DispatchResult::Unknown { preface } => {
                tracing::trace!(parent: &self.span, preface, stream_id = id, "unknown stream preface");
                self.dispatcher.release(id);
                let _ = sock.stop_sending(id, Http3ErrorCode::UnknownStreamType);
                Ok(())
            }
        }
    }

    fn bind_ingress_control_stream(
        &mut self,
        sock: &mut dyn QuicSocket,
        id: StreamId,
        stream_type: UniStreamType,
    ) -> ProtResult<()> {
        let ctrl = match self.control_streams.get_mut(&stream_type) {
            Some(ctrl) => ctrl,
            // 出向控制流在会话启动时就该建好
            None => {
                return Err(ProtError::connection(
                    Http3ErrorCode::GeneralProtocolError,
                    "ingress control stream without egress counterpart",
                ))
            }
        };
        if ctrl.has_ingress() {
            // 每类只允许一条
            return Err(ProtError::connection(
                Http3ErrorCode::WrongStreamCount,
                "HTTP wrong stream count",
            ));
        }
        ctrl.set_ingress(id);
        sock.set_control_stream(id)?;
        // 前导之后可能还有数据, 传输层不会为它再发通知, 主动补一次读
        self.read_control_stream(sock, id)
    }

    // ------------------------------------------------------------------
    // 推送

    /// 把已到达的裸推送流和推送事务撮合起来, 绑定是幂等的
    fn try_bind_ingress_push(&mut self, sock: &mut dyn QuicSocket, push_id: u64) -> bool {
        let stream_id = match self.registry.lookup.stream_by_push(push_id) {
            Some(id) => id,
            None => return false,
        };
        let version_codec = match self.version {
            Some(HqVersion::Hq) => HqStreamCodec::new(
                stream_id,
                false,
                self.qpack.as_ref().expect("qpack bound with HQ").clone(),
            ),
            _ => return false,
        };
        let stream = match self.registry.ingress_push.get_mut(&push_id) {
            Some(s) => s,
            None => return false,
        };
        if stream.ingress_id.is_some() {
            return true;
        }
        stream.ingress_id = Some(stream_id);
        stream.codec = Some(Box::new(version_codec));
        self.pending_read_set.insert(stream_id);
        sock.resume_read(stream_id);
        tracing::trace!(parent: &self.span, push_id, stream_id, "bound ingress push stream");
        true
    }

    fn on_push_promise_headers_complete(
        &mut self,
        sock: &mut dyn QuicSocket,
        parent: StreamKey,
        push_id: u64,
        msg: Message,
    ) {
        let parent_id = match self.stream_id_of(parent) {
            Some(id) => id,
            None => return,
        };
        let mut accepted = None;
        self.with_handler(sock, parent, |handler, txn| {
            accepted = handler.on_push_promise(txn, push_id, &msg);
        });
        let handler = match accepted {
            Some(handler) => handler,
            None => return,
        };
        let mut stream = InnerStream::new_ingress_push(push_id, parent_id);
        stream.handler = Some(handler);
        stream.ingress_started = true;
        // 推送流只有入向
        stream.egress_complete = true;
        self.registry.ingress_push.insert(push_id, stream);
        self.arm_timeout(StreamKey::Push(push_id));
        self.try_bind_ingress_push(sock, push_id);
        // 推送承诺里的请求头交给推送事务
        self.with_handler(sock, StreamKey::Push(push_id), |handler, txn| {
            handler.on_headers(txn, msg)
        });
    }

    /// 服务端发起推送: 父流上发PUSH_PROMISE, 推送流走单向流
    pub(crate) fn new_pushed_transaction(
        &mut self,
        sock: &mut dyn QuicSocket,
        parent: StreamKey,
        promise: Message,
        handler: Box<dyn StreamHandler>,
    ) -> ProtResult<StreamId> {
        if self.direction.is_upstream() {
            return Err(ProtError::Extension("only downstream can push"));
        }
        if self.version != Some(HqVersion::Hq) {
            return Err(ProtError::Extension("push requires the HQ variant"));
        }
        if !promise.is_request() {
            return Err(ProtError::Extension("push promise must carry a request"));
        }
        let push_id = self.next_push_id;
        // 父流上的PUSH_PROMISE帧
        {
            let parent_stream = self
                .registry
                .get_mut(parent)
                .ok_or(ProtError::Extension("parent transaction gone"))?;
            let codec = parent_stream
                .codec
                .as_mut()
                .ok_or(ProtError::Extension("parent codec gone"))?;
            codec.generate_push_promise(&mut parent_stream.write_buf, push_id, &promise)?;
        }
        self.next_push_id += 1;
        self.notify_pending_egress(sock, parent);

        let id = sock.create_unidirectional_stream()?;
        let codec = Box::new(HqStreamCodec::new(
            id,
            false,
            self.qpack.as_ref().expect("qpack bound with HQ").clone(),
        ));
        let mut stream = InnerStream::new_egress_push(id, push_id, codec as Box<dyn StreamCodec>);
        // 推送流前导: 类型加push id
        {
            use crate::codec::encode_varint;
            encode_varint(&mut stream.write_buf, Consts::UNI_STREAM_PUSH);
            encode_varint(&mut stream.write_buf, push_id);
        }
        stream.handler = Some(handler);
        stream.ingress_started = true;
        // 推送流没有入向
        stream.eom_gate.set_codec();
        stream.eom_gate.set_transport();
        self.registry.egress_push.insert(id, stream);
        self.arm_timeout(StreamKey::Stream(id));
        self.notify_pending_egress(sock, StreamKey::Stream(id));
        Ok(id)
    }

    // ------------------------------------------------------------------
    // 读数据处理

    fn process_read_data(&mut self, sock: &mut dyn QuicSocket) {
        let ids: Vec<StreamId> = self.pending_read_set.iter().copied().collect();
        for id in ids {
            let key = match self.registry.key_for_stream_id(id) {
                Some(key) => key,
                None => {
                    self.pending_read_set.remove(&id);
                    continue;
                }
            };
            let blocked = self.process_stream_read(sock, key, id);
            if !blocked {
                self.pending_read_set.remove(&id);
            }
        }
    }

    /// 返回是否因等待其他流的数据而阻塞
    fn process_stream_read(
        &mut self,
        sock: &mut dyn QuicSocket,
        key: StreamKey,
        id: StreamId,
    ) -> bool {
        loop {
            let stream = match self.registry.get_mut(key) {
                Some(s) => s,
                None => return false,
            };
            if stream.detached {
                // 脱离后的残余数据直接扔掉
                stream.read_buf = BinaryMut::new();
                stream.read_eof = false;
                return false;
            }
            if stream.ingress_error {
                return false;
            }
            if stream.eom_gate.codec_seen() && stream.read_buf.remaining() > 0 {
                tracing::trace!(parent: &self.span, stream_id = id, "data after message complete");
                let err = ProtError::stream_abort(
                    Http3ErrorCode::GeneralProtocolError,
                    "unexpected data after request",
                );
                self.error_on_transaction(sock, key, err);
                self.send_abort_impl(sock, key, Http3ErrorCode::GeneralProtocolError);
                return false;
            }
            if stream.read_buf.remaining() == 0 {
                break;
            }
            let data = stream.read_buf.chunk().to_vec();
            let codec = match &mut stream.codec {
                Some(codec) => codec,
                None => return false,
            };
            let mut events = Vec::new();
            let consumed = match codec.on_ingress(&data, &mut events) {
                Ok(n) => n,
                Err(err) => {
                    self.dispatch_codec_events(sock, key, vec![CodecEvent::Error(err)]);
                    return false;
                }
            };
            if consumed > 0 {
                // 事件分发可能动流表, 先收掉借用
                let stream = self.registry.get_mut(key).unwrap();
                stream.read_buf.advance(consumed);
            }
            self.dispatch_codec_events(sock, key, events);
            if consumed == 0 {
                // 编解码器没吃进任何字节: 等它要的数据(可能在QPACK编码流上)
                return self.registry.get_mut(key).is_some();
            }
        }

        // 缓冲读干净了, EOF交给编解码器并落传输侧门闩
        let stream = match self.registry.get_mut(key) {
            Some(s) => s,
            None => return false,
        };
        if stream.read_eof && !stream.eom_gate.transport_seen() && !stream.ingress_error {
            let codec = match &mut stream.codec {
                Some(codec) => codec,
                None => return false,
            };
            let mut events = Vec::new();
            if let Err(err) = codec.on_ingress_eof(&mut events) {
                events.push(CodecEvent::Error(err));
            }
            self.dispatch_codec_events(sock, key, events);
            if let Some(stream) = self.registry.get_mut(key) {
                if stream.eom_gate.set_transport() {
                    self.fire_ingress_eom(sock, key);
                }
            }
        }
        false
    }

    fn dispatch_codec_events(
        &mut self,
        sock: &mut dyn QuicSocket,
        key: StreamKey,
        events: Vec<CodecEvent>,
    ) {
        for event in events {
            if self.registry.get(key).is_none() {
                return;
            }
            match event {
                CodecEvent::MessageBegin => {
                    let stream = self.registry.get_mut(key).unwrap();
                    if stream.ingress_push_id.is_some() {
                        self.latch_error(ProtError::connection_kind(
                            ErrorKind::Dropped,
                            Http3ErrorCode::MalformedFramePushPromise,
                            "message begin in the middle of push promise",
                        ));
                        return;
                    }
                }
                CodecEvent::PushMessageBegin(push_id) => {
                    let stream = self.registry.get_mut(key).unwrap();
                    if stream.ingress_push_id.is_some() {
                        self.latch_error(ProtError::connection_kind(
                            ErrorKind::Dropped,
                            Http3ErrorCode::MalformedFramePushPromise,
                            "push promise in the middle of push promise",
                        ));
                        return;
                    }
                    stream.ingress_push_id = Some(push_id);
                }
                CodecEvent::HeadersComplete(msg) => {
                    self.handle_headers_complete(sock, key, msg);
                }
                CodecEvent::Body(data) => {
                    self.reset_timeout(key);
                    self.with_handler(sock, key, |handler, txn| handler.on_body(txn, data));
                }
                CodecEvent::ChunkHeader(len) => {
                    self.with_handler(sock, key, |handler, txn| handler.on_chunk_header(txn, len));
                }
                CodecEvent::ChunkComplete => {
                    self.with_handler(sock, key, |handler, txn| handler.on_chunk_complete(txn));
                }
                CodecEvent::Trailers(trailers) => {
                    self.with_handler(sock, key, |handler, txn| handler.on_trailers(txn, trailers));
                }
                CodecEvent::MessageComplete => {
                    let stream = self.registry.get_mut(key).unwrap();
                    if let Some(codec) = &mut stream.codec {
                        codec.set_parser_paused(true);
                    }
                    if stream.eom_gate.set_codec() {
                        self.fire_ingress_eom(sock, key);
                    }
                }
                CodecEvent::Error(err) => {
                    if err.is_connection_level() {
                        self.latch_error(err);
                        return;
                    }
                    let code = err.code().unwrap_or(Http3ErrorCode::GeneralProtocolError);
                    let from_codec_abort = err.kind() == Some(ErrorKind::StreamAbort);
                    self.error_on_transaction(sock, key, err);
                    if from_codec_abort {
                        // 编解码器的流级错误还要在传输层把流关掉
                        self.send_abort_impl(sock, key, code);
                    }
                }
            }
        }
    }

    fn handle_headers_complete(&mut self, sock: &mut dyn QuicSocket, key: StreamKey, msg: Message) {
        // 推送承诺闩着的话, 这些头属于被推送的事务
        let pending_push = match self.registry.get_mut(key) {
            Some(stream) => stream.ingress_push_id.take(),
            None => return,
        };
        if let Some(push_id) = pending_push {
            self.on_push_promise_headers_complete(sock, key, push_id, msg);
            return;
        }

        match self.version {
            Some(HqVersion::H1qV1) => {
                if msg.has_connection_close() && !self.drain.is_done() {
                    if self.drain.is_none() {
                        self.drain_impl(sock);
                    }
                    self.drain.v1_close_received();
                }
            }
            Some(HqVersion::Hq) => {
                // 解码产生的确认要尽快出门
                self.schedule_write(sock);
            }
            _ => {}
        }

        let stream = match self.registry.get_mut(key) {
            Some(s) => s,
            None => return,
        };
        stream.ingress_started = true;
        self.reset_timeout(key);

        if self.registry.get(key).map(|s| s.handler.is_none()) == Some(true) {
            let mut controller = self.controller.take();
            let handler = match &mut controller {
                Some(controller) => {
                    let mut txn = Txn {
                        ctl: self,
                        sock,
                        key,
                    };
                    controller.on_request(&mut txn, &msg)
                }
                None => None,
            };
            if let Some(controller) = controller {
                self.controller = Some(controller);
            }
            match handler {
                Some(handler) => {
                    if let Some(stream) = self.registry.get_mut(key) {
                        stream.handler = Some(handler);
                    }
                }
                None => {
                    let _ = self.send_abort(sock, key, Http3ErrorCode::RequestRejected);
                    return;
                }
            }
        }

        self.with_handler(sock, key, |handler, txn| handler.on_headers(txn, msg));
    }

    fn fire_ingress_eom(&mut self, sock: &mut dyn QuicSocket, key: StreamKey) {
        self.cancel_timeout(key);
        self.with_handler(sock, key, |handler, txn| handler.on_eom(txn));
    }

    // ------------------------------------------------------------------
    // 处理器回调

    /// 回调期间把处理器从流上摘下来, 避免回调再进引擎时撞上借用
    fn with_handler<F>(&mut self, sock: &mut dyn QuicSocket, key: StreamKey, f: F)
    where
        F: FnOnce(&mut Box<dyn StreamHandler>, &mut Txn<'_>),
    {
        let mut handler = match self.registry.get_mut(key) {
            Some(stream) => match stream.handler.take() {
                Some(handler) => handler,
                None => return,
            },
            None => return,
        };
        {
            let mut txn = Txn {
                ctl: self,
                sock,
                key,
            };
            f(&mut handler, &mut txn);
        }
        if let Some(stream) = self.registry.get_mut(key) {
            if stream.handler.is_none() {
                stream.handler = Some(handler);
            }
        }
    }

    // ------------------------------------------------------------------
    // 出向: 事务调用

    pub(crate) fn send_headers(
        &mut self,
        sock: &mut dyn QuicSocket,
        key: StreamKey,
        msg: Message,
        include_eom: bool,
    ) -> ProtResult<()> {
        if self.version == Some(HqVersion::H1qV1) {
            self.v1_check_sending_goaway(sock, &msg);
        }
        let is_final = msg.is_final();
        let is_response = msg.is_response();
        let stream = self
            .registry
            .get_mut(key)
            .ok_or(ProtError::Extension("transaction gone"))?;
        let old_offset = stream.stream_write_offset();
        let codec = stream
            .codec
            .as_mut()
            .ok_or(ProtError::Extension("codec not bound"))?;
        codec.generate_headers(&mut stream.write_buf, &msg, include_eom)?;
        let new_offset = stream.stream_write_offset();
        stream.egress_headers_sent = true;

        if is_response && new_offset > old_offset && !stream.first_header_byte_sent {
            stream.first_header_byte_sent = true;
            stream.arm_byte_event(new_offset, ByteEvent::FirstHeaderByte);
        }
        if include_eom {
            stream.pending_eom = true;
            stream.egress_complete = true;
            stream.arm_byte_event(new_offset, ByteEvent::LastByte);
        }
        // 最终头部要等对端确认, 才好通知事务头已送达
        if is_final && new_offset > 0 {
            self.arm_egress_headers_ack(sock, key, new_offset - 1);
        }
        self.notify_pending_egress(sock, key);
        Ok(())
    }

    fn arm_egress_headers_ack(
        &mut self,
        sock: &mut dyn QuicSocket,
        key: StreamKey,
        offset: u64,
    ) {
        let stream = match self.registry.get_mut(key) {
            Some(s) => s,
            None => return,
        };
        let id = match stream.egress_id {
            Some(id) => id,
            None => return,
        };
        match sock.register_delivery_callback(id, offset) {
            Ok(()) => {
                stream.active_delivery_callbacks += 1;
                stream.pending_byte_events += 1;
                stream.egress_headers_ack_offset = Some(offset);
            }
            Err(_) => {
                let err = ProtError::stream_abort(
                    Http3ErrorCode::InternalError,
                    "failed to register delivery callback",
                );
                self.error_on_transaction(sock, key, err);
            }
        }
    }

    pub(crate) fn send_body(
        &mut self,
        sock: &mut dyn QuicSocket,
        key: StreamKey,
        data: Binary,
        include_eom: bool,
    ) -> ProtResult<usize> {
        let stream = self
            .registry
            .get_mut(key)
            .ok_or(ProtError::Extension("transaction gone"))?;
        let old_offset = stream.stream_write_offset();
        let codec = stream
            .codec
            .as_mut()
            .ok_or(ProtError::Extension("codec not bound"))?;
        let encoded = codec.generate_body(&mut stream.write_buf, data, include_eom)?;
        if encoded > 0 && !stream.first_body_byte_sent {
            stream.first_body_byte_sent = true;
            stream.arm_byte_event(old_offset + 1, ByteEvent::FirstBodyByte);
        }
        if include_eom {
            stream.pending_eom = true;
            stream.egress_complete = true;
            let offset = stream.stream_write_offset();
            stream.arm_byte_event(offset, ByteEvent::LastByte);
        }
        self.notify_pending_egress(sock, key);
        Ok(encoded)
    }

    pub(crate) fn send_chunk_header(
        &mut self,
        sock: &mut dyn QuicSocket,
        key: StreamKey,
        len: usize,
    ) -> ProtResult<usize> {
        let stream = self
            .registry
            .get_mut(key)
            .ok_or(ProtError::Extension("transaction gone"))?;
        let codec = stream
            .codec
            .as_mut()
            .ok_or(ProtError::Extension("codec not bound"))?;
        let encoded = codec.generate_chunk_header(&mut stream.write_buf, len)?;
        self.notify_pending_egress(sock, key);
        Ok(encoded)
    }

    pub(crate) fn send_chunk_terminator(
        &mut self,
        sock: &mut dyn QuicSocket,
        key: StreamKey,
    ) -> ProtResult<usize> {
        let stream = self
            .registry
            .get_mut(key)
            .ok_or(ProtError::Extension("transaction gone"))?;
        let codec = stream
            .codec
            .as_mut()
            .ok_or(ProtError::Extension("codec not bound"))?;
        let encoded = codec.generate_chunk_terminator(&mut stream.write_buf)?;
        self.notify_pending_egress(sock, key);
        Ok(encoded)
    }

    pub(crate) fn send_eom(
        &mut self,
        sock: &mut dyn QuicSocket,
        key: StreamKey,
        trailers: Option<HeaderMap>,
    ) -> ProtResult<usize> {
        let stream = self
            .registry
            .get_mut(key)
            .ok_or(ProtError::Extension("transaction gone"))?;
        let codec = stream
            .codec
            .as_mut()
            .ok_or(ProtError::Extension("codec not bound"))?;
        let mut encoded = 0;
        if let Some(trailers) = trailers {
            encoded += codec.generate_trailers(&mut stream.write_buf, &trailers)?;
        }
        encoded += codec.generate_eom(&mut stream.write_buf)?;
        stream.pending_eom = true;
        stream.egress_complete = true;
        let offset = stream.stream_write_offset();
        stream.arm_byte_event(offset, ByteEvent::LastByte);
        self.notify_pending_egress(sock, key);
        Ok(encoded)
    }

    pub(crate) fn send_abort(
        &mut self,
        sock: &mut dyn QuicSocket,
        key: StreamKey,
        code: Http3ErrorCode,
    ) -> ProtResult<()> {
        self.send_abort_impl(sock, key, code);
        Ok(())
    }

    fn send_abort_impl(&mut self, sock: &mut dyn QuicSocket, key: StreamKey, code: Http3ErrorCode) {
        let (stream_id, egress_id) = match self.registry.get(key) {
            Some(stream) => (stream.stream_id(), stream.egress_id),
            None => return,
        };
        if let Some(id) = stream_id {
            self.abort_transport_stream(sock, id, egress_id.is_some(), code);
        }
        let egress_id = match self.registry.get_mut(key) {
            Some(stream) => {
                stream.abort_ingress();
                stream.abort_egress();
                stream.errored = true;
                stream.queue_handle.transport_enqueued = false;
                stream.egress_id
            }
            None => None,
        };
        if let Some(id) = egress_id {
            self.egress_queue.clear_pending_egress(id);
        }
    }

    fn abort_both_directions(
        &mut self,
        sock: &mut dyn QuicSocket,
        id: StreamId,
        code: Http3ErrorCode,
    ) {
        self.abort_transport_stream(sock, id, true, code);
    }

    /// 双向中止: 入向发STOP_SENDING并撤销QPACK状态, 出向RESET
    fn abort_transport_stream(
        &mut self,
        sock: &mut dyn QuicSocket,
        id: StreamId,
        has_egress: bool,
        code: Http3ErrorCode,
    ) {
        if !sock.good() {
            return;
        }
        let peer_readable = quic::is_bidirectional(id)
            || quic::is_server_initiated(id) == self.direction.is_upstream();
        if peer_readable {
            if let Some(qpack) = &self.qpack {
                if let Ok(mut qpack) = qpack.write() {
                    qpack.encode_cancel_stream(id);
                }
            }
            let _ = sock.stop_sending(id, code);
        }
        if has_egress && (quic::is_bidirectional(id) || !peer_readable) {
            let _ = sock.reset_stream(id, code);
        }
    }

    pub(crate) fn pause_ingress(&mut self, sock: &mut dyn QuicSocket, key: StreamKey) {
        if let Some(stream) = self.registry.get(key) {
            if let Some(id) = stream.ingress_id {
                sock.pause_read(id);
            }
        }
    }

    pub(crate) fn resume_ingress(&mut self, sock: &mut dyn QuicSocket, key: StreamKey) {
        if let Some(stream) = self.registry.get(key) {
            if let Some(id) = stream.ingress_id {
                sock.resume_read(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // 部分可靠

    fn ensure_partial_reliability(&self) -> ProtResult<()> {
        let capable = self
            .version
            .map(|v| v.partial_reliability_capable())
            .unwrap_or(false);
        if !capable || !self.config.partial_reliability {
            return Err(ProtError::Extension(
                "partially reliable operations are not supported",
            ));
        }
        Ok(())
    }

    pub(crate) fn skip_body_to(
        &mut self,
        sock: &mut dyn QuicSocket,
        key: StreamKey,
        body_offset: u64,
    ) -> ProtResult<u64> {
        self.ensure_partial_reliability()?;
        let stream = self
            .registry
            .get_mut(key)
            .ok_or(ProtError::Extension("transaction gone"))?;
        let id = stream
            .egress_id
            .ok_or(ProtError::Extension("no egress stream"))?;
        let codec = stream
            .codec
            .as_mut()
            .ok_or(ProtError::Extension("codec not bound"))?;
        let wire_offset = match codec.on_egress_body_skip(body_offset) {
            Ok(v) => v,
            Err(err) => {
                self.error_on_transaction(sock, key, err);
                return Err(ProtError::Extension("failed to send a skip"));
            }
        };
        let trimmed = stream.trim_pending_egress(wire_offset);
        stream.bytes_skipped += trimmed;
        let res = sock.send_data_expired(id, wire_offset)?;
        Ok(res)
    }

    pub(crate) fn reject_body_to(
        &mut self,
        sock: &mut dyn QuicSocket,
        key: StreamKey,
        body_offset: u64,
    ) -> ProtResult<u64> {
        self.ensure_partial_reliability()?;
        let stream = self
            .registry
            .get_mut(key)
            .ok_or(ProtError::Extension("transaction gone"))?;
        let id = stream
            .ingress_id
            .ok_or(ProtError::Extension("no ingress stream"))?;
        let codec = stream
            .codec
            .as_mut()
            .ok_or(ProtError::Extension("codec not bound"))?;
        let wire_offset = match codec.on_egress_body_reject(body_offset) {
            Ok(v) => v,
            Err(err) => {
                self.error_on_transaction(sock, key, err);
                return Err(ProtError::Extension("failed to send a reject"));
            }
        };
        let res = sock.send_data_rejected(id, wire_offset)?;
        Ok(res)
    }

    fn on_data_expired(&mut self, sock: &mut dyn QuicSocket, id: StreamId, offset: u64) {
        if self.ensure_partial_reliability().is_err() {
            return;
        }
        let key = match self.registry.key_for_stream_id(id) {
            Some(key) => key,
            None => return,
        };
        let body_offset = {
            let stream = match self.registry.get_mut(key) {
                Some(s) if !s.detached => s,
                _ => return,
            };
            match stream.codec.as_mut() {
                Some(codec) => codec.on_ingress_data_expired(offset),
                None => return,
            }
        };
        match body_offset {
            Ok(body_offset) => {
                self.with_handler(sock, key, |handler, _txn| {
                    handler.on_body_skipped(body_offset)
                });
            }
            Err(err) => self.error_on_transaction(sock, key, err),
        }
    }

    fn on_data_rejected(&mut self, sock: &mut dyn QuicSocket, id: StreamId, offset: u64) {
        if self.ensure_partial_reliability().is_err() {
            return;
        }
        let key = match self.registry.key_for_stream_id(id) {
            Some(key) => key,
            None => return,
        };
        let body_offset = {
            let stream = match self.registry.get_mut(key) {
                Some(s) if !s.detached => s,
                _ => return,
            };
            match stream.codec.as_mut() {
                Some(codec) => codec.on_ingress_data_rejected(offset),
                None => return,
            }
        };
        match body_offset {
            Ok(body_offset) => {
                let stream = match self.registry.get_mut(key) {
                    Some(s) => s,
                    None => return,
                };
                // 对端拒绝到线上偏移为止, 还没提交的那段直接丢弃
                stream.bytes_skipped += stream.trim_pending_egress(offset);
                self.with_handler(sock, key, |handler, _txn| {
                    handler.on_body_rejected(body_offset)
                });
            }
            Err(err) => self.error_on_transaction(sock, key, err),
        }
    }

    // ------------------------------------------------------------------
    // 出向调度

    pub(crate) fn notify_pending_egress(&mut self, sock: &mut dyn QuicSocket, key: StreamKey) {
        if let Some(stream) = self.registry.get_mut(key) {
            stream.queue_handle.txn_enqueued = true;
        }
        self.signal_pending_egress_impl(sock, key);
        self.schedule_write(sock);
    }

    fn signal_pending_egress_impl(&mut self, sock: &mut dyn QuicSocket, key: StreamKey) {
        let id = match self.registry.get(key).and_then(|s| s.egress_id) {
            Some(id) => id,
            None => return,
        };
        let window_open = match sock.stream_flow_control(id) {
            Ok(info) => info.send_window_available > 0,
            Err(_) => false,
        };
        if window_open {
            self.egress_queue.signal_pending_egress(id);
            if let Some(stream) = self.registry.get_mut(key) {
                stream.queue_handle.transport_enqueued = true;
            }
        } else {
            tracing::trace!(parent: &self.span, stream_id = id, "delay pending egress on blocked stream");
        }
    }

    fn schedule_write(&mut self, sock: &mut dyn QuicSocket) {
        if self.scheduled_write {
            return;
        }
        self.scheduled_write = true;
        sock.notify_pending_write();
    }

    fn on_flow_control_update(&mut self, sock: &mut dyn QuicSocket, id: StreamId) {
        let info = match sock.stream_flow_control(id) {
            Ok(info) => info,
            Err(_) => return,
        };
        if self.find_control_by_egress(id).is_some() {
            if info.send_window_available > 0 {
                self.schedule_write(sock);
            }
            return;
        }
        let key = match self.registry.key_for_stream_id(id) {
            Some(key) => key,
            None => return,
        };
        let (has_pending, only_eom) = match self.registry.get(key) {
            Some(stream) => (
                stream.has_pending_egress(),
                !stream.has_pending_body() && stream.has_pending_eom(),
            ),
            None => return,
        };
        if info.send_window_available > 0 || only_eom {
            if has_pending {
                self.egress_queue.signal_pending_egress(id);
                if let Some(stream) = self.registry.get_mut(key) {
                    stream.queue_handle.transport_enqueued = true;
                }
            }
            self.schedule_write(sock);
        }
    }

    fn write_control_streams(&mut self, sock: &mut dyn QuicSocket, max_egress: u64) -> u64 {
        let mut remaining = max_egress;
        let types: Vec<UniStreamType> = self.control_streams.keys().copied().collect();
        for stream_type in types {
            if remaining == 0 {
                break;
            }
            let ctrl = self.control_streams.get_mut(&stream_type).unwrap();
            if ctrl.write_buf.remaining() == 0 {
                continue;
            }
            let id = ctrl.egress_id;
            let info = match sock.stream_flow_control(id) {
                Ok(info) => info,
                Err(err) => {
                    self.handle_session_error_prot(stream_type, err);
                    continue;
                }
            };
            let can_send = info.send_window_available.min(remaining);
            let send_len = can_send.min(ctrl.write_buf.remaining() as u64) as usize;
            if send_len == 0 {
                continue;
            }
            let data = Binary::from(ctrl.write_buf.chunk()[..send_len].to_vec());
            ctrl.write_buf.advance(send_len);
            match sock.write_chain(id, data, false, false) {
                Ok(not_written) => {
                    let mut sent = send_len as u64;
                    if let Some(rest) = not_written {
                        sent -= rest.remaining() as u64;
                        // 传输层退回的数据放回缓冲头部
                        let mut merged = BinaryMut::new();
                        merged.put_slice(rest.chunk());
                        merged.put_slice(ctrl.write_buf.chunk());
                        ctrl.write_buf = merged;
                    }
                    ctrl.bytes_written += sent;
                    remaining -= sent;
                }
                Err(_) => {
                    self.handle_session_error(
                        stream_type,
                        QuicErrorCode::Local(LocalErrorCode::InternalError),
                    );
                }
            }
        }
        max_egress - remaining
    }

    fn write_request_streams(&mut self, sock: &mut dyn QuicSocket, max_egress: u64) -> u64 {
        let mut remaining = max_egress;
        for (id, ratio) in self.egress_queue.next_egress() {
            if remaining == 0 {
                break;
            }
            let sent = self.request_stream_write(sock, id, remaining, ratio);
            remaining -= sent.min(remaining);
        }
        max_egress - remaining
    }

    fn request_stream_write(
        &mut self,
        sock: &mut dyn QuicSocket,
        id: StreamId,
        max_egress: u64,
        _ratio: f64,
    ) -> u64 {
        let key = match self.registry.key_for_stream_id(id) {
            Some(key) => key,
            None => {
                self.egress_queue.clear_pending_egress(id);
                return 0;
            }
        };
        let info = match sock.stream_flow_control(id) {
            Ok(info) => info,
            Err(_) => {
                self.handle_write_error(
                    sock,
                    key,
                    QuicErrorCode::Local(LocalErrorCode::InternalError),
                );
                return 0;
            }
        };
        let window = info.send_window_available;
        let can_send = window.min(max_egress);

        // 缓冲装不满窗口时先问事务要字节
        let wants = self
            .registry
            .get(key)
            .map(|s| s.wants_on_write_ready(can_send))
            .unwrap_or(false);
        if wants {
            let max_body = can_send.saturating_sub(
                self.registry
                    .get(key)
                    .map(|s| s.write_buf.remaining() as u64)
                    .unwrap_or(0),
            );
            self.with_handler(sock, key, |handler, txn| {
                handler.on_write_ready(txn, max_body)
            });
        }

        let stream = match self.registry.get_mut(key) {
            Some(s) => s,
            None => return 0,
        };
        if wants && stream.write_buf.remaining() == 0 && !stream.pending_eom {
            // 事务这次什么都没给, 限速场景自己清出队列
            stream.queue_handle.txn_enqueued = false;
            stream.queue_handle.transport_enqueued = false;
            self.egress_queue.clear_pending_egress(id);
            return 0;
        }

        let buffered = stream.write_buf.remaining() as u64;
        let send_len = can_send.min(buffered);
        let send_eof = stream.pending_eom
            && stream.egress_complete
            && buffered <= can_send;
        if send_len == 0 && !send_eof {
            stream.queue_handle.transport_enqueued = false;
            self.egress_queue.clear_pending_egress(id);
            return 0;
        }
        let data = Binary::from(stream.write_buf.chunk()[..send_len as usize].to_vec());
        stream.write_buf.advance(send_len as usize);

        let write_res = sock.write_chain(id, data, send_eof, send_eof);
        let stream = match self.registry.get_mut(key) {
            Some(s) => s,
            None => return 0,
        };
        let sent = match write_res {
            Ok(not_written) => {
                let mut sent = send_len;
                let mut fin_written = send_eof;
                if let Some(rest) = not_written {
                    sent -= rest.remaining() as u64;
                    fin_written = false;
                    stream.unshift_write(rest);
                }
                if fin_written {
                    // FIN落地后事务要等送达确认或取消才能走
                    stream.pending_eom = false;
                    stream.queue_handle.txn_enqueued = false;
                    stream.pending_byte_events += 1;
                    stream.active_delivery_callbacks += 1;
                }
                stream.bytes_written += sent;
                sent
            }
            Err(_) => {
                self.handle_write_error(
                    sock,
                    key,
                    QuicErrorCode::Local(LocalErrorCode::InternalError),
                );
                return 0;
            }
        };

        let committed = stream.stream_egress_committed_offset();
        let fired = stream.take_fired_byte_events(committed);
        for event in fired {
            self.with_handler(sock, key, |handler, _txn| match event {
                ByteEvent::FirstHeaderByte => handler.on_first_header_byte_flushed(),
                ByteEvent::FirstBodyByte => handler.on_first_body_byte_flushed(),
                ByteEvent::LastByte => handler.on_last_byte_flushed(),
            });
        }

        let stream = match self.registry.get_mut(key) {
            Some(s) => s,
            None => return sent,
        };
        let flow_control_blocked = sent == window && !send_eof && window > 0;
        if stream.queue_handle.transport_enqueued
            && (!stream.has_pending_egress() || flow_control_blocked)
        {
            stream.queue_handle.transport_enqueued = false;
            self.egress_queue.clear_pending_egress(id);
        }
        if flow_control_blocked {
            tracing::trace!(parent: &self.span, stream_id = id, "stream flow control blocked");
        }
        sent
    }

    // ------------------------------------------------------------------
    // 送达确认

    fn on_delivery_ack(&mut self, sock: &mut dyn QuicSocket, id: StreamId, offset: u64) {
        if let Some(stream_type) = self.find_control_by_egress(id) {
            if let Some(ctrl) = self.control_streams.get_mut(&stream_type) {
                if ctrl.pending_delivery > 0 {
                    ctrl.pending_delivery -= 1;
                }
            }
            tracing::trace!(parent: &self.span, stream_id = id, "GOAWAY received by remote endpoint");
            self.on_goaway_ack(sock);
            return;
        }
        let key = match self.registry.key_for_stream_id(id) {
            Some(key) => key,
            None => {
                tracing::error!(parent: &self.span, stream_id = id, "delivery ack for erased stream");
                return;
            }
        };
        let is_headers_ack = {
            let stream = match self.registry.get_mut(key) {
                Some(s) => s,
                None => return,
            };
            if stream.active_delivery_callbacks > 0 {
                stream.active_delivery_callbacks -= 1;
            }
            if stream.pending_byte_events > 0 {
                stream.pending_byte_events -= 1;
            }
            if stream.egress_headers_ack_offset == Some(offset) {
                stream.egress_headers_ack_offset = None;
                true
            } else {
                false
            }
        };
        self.with_handler(sock, key, |handler, _txn| {
            if is_headers_ack {
                handler.on_last_egress_header_byte_acked();
            } else {
                handler.on_last_byte_acked();
            }
        });
    }

    fn on_delivery_canceled(&mut self, sock: &mut dyn QuicSocket, id: StreamId, _offset: u64) {
        if self.find_control_by_egress(id).is_some() {
            // 没指望走到这, 加速排空
            self.drain.set(DrainState::Done);
            self.check_for_shutdown(sock);
            return;
        }
        let key = match self.registry.key_for_stream_id(id) {
            Some(key) => key,
            None => return,
        };
        if let Some(stream) = self.registry.get_mut(key) {
            if stream.active_delivery_callbacks > 0 {
                stream.active_delivery_callbacks -= 1;
            }
            if stream.pending_byte_events > 0 {
                stream.pending_byte_events -= 1;
            }
            stream.egress_headers_ack_offset = None;
        }
    }

    // ------------------------------------------------------------------
    // 排空与关闭

    pub fn notify_pending_shutdown(&mut self, sock: &mut dyn QuicSocket) {
        self.drain_impl(sock);
    }

    fn drain_impl(&mut self, sock: &mut dyn QuicSocket) {
        if !self.drain.is_none() {
            tracing::trace!(parent: &self.span, "already draining");
            return;
        }
        self.drain.set(DrainState::Pending);
        if self.version.is_some() {
            self.send_goaway(sock);
        }
    }

    fn send_goaway(&mut self, sock: &mut dyn QuicSocket) {
        match self.version {
            Some(HqVersion::H1qV1) => {
                // 下一个消息上带Connection: close
                for key in self.registry.collect_keys() {
                    if let Some(stream) = self.registry.get_mut(key) {
                        if let Some(codec) = &mut stream.codec {
                            let _ = codec.generate_goaway(&mut stream.write_buf);
                        }
                    }
                }
            }
            Some(_) => self.send_goaway_frame(sock),
            None => {}
        }
    }

    fn send_goaway_frame(&mut self, sock: &mut dyn QuicSocket) {
        if self.drain.is_done() {
            return;
        }
        if self.direction.is_upstream() {
            // 客户端最多发一个GOAWAY, 发完直接进Done
            let max_id = self.max_incoming_stream_id;
            if let Some(ctrl) = self.control_streams.get_mut(&UniStreamType::Control) {
                if let Some(codec) = &mut ctrl.egress_codec {
                    let _ = codec.generate_goaway(&mut ctrl.write_buf, max_id);
                }
            }
            self.drain.set(DrainState::Done);
            self.schedule_write(sock);
            return;
        }
        debug_assert!(matches!(
            self.drain.state(),
            DrainState::Pending | DrainState::FirstGoaway
        ));
        let goaway_id = self.goaway_stream_id();
        let generated = {
            let ctrl = match self.control_streams.get_mut(&UniStreamType::Control) {
                Some(ctrl) => ctrl,
                None => {
                    self.drain.set(DrainState::Done);
                    return;
                }
            };
            match &mut ctrl.egress_codec {
                Some(codec) => codec
                    .generate_goaway(&mut ctrl.write_buf, goaway_id)
                    .unwrap_or(0),
                None => 0,
            }
        };
        if generated == 0 {
            // 生成失败就直接走捷径关
            tracing::error!(parent: &self.span, "error generating GOAWAY");
            self.drain.set(DrainState::Done);
            return;
        }
        tracing::trace!(parent: &self.span, max_stream_id = goaway_id, "generated GOAWAY");
        let (egress_id, ack_offset) = {
            let ctrl = self.control_streams.get(&UniStreamType::Control).unwrap();
            (ctrl.egress_id, ctrl.stream_write_offset())
        };
        if sock
            .register_delivery_callback(egress_id, ack_offset)
            .is_err()
        {
            self.drain.set(DrainState::Done);
            return;
        }
        if let Some(ctrl) = self.control_streams.get_mut(&UniStreamType::Control) {
            ctrl.pending_delivery += 1;
        }
        self.schedule_write(sock);
        if self.drain.state() == DrainState::Pending {
            self.drain.set(DrainState::FirstGoaway);
        } else {
            self.drain.set(DrainState::SecondGoaway);
        }
    }

    /// 第一个GOAWAY不设上限, 第二个宣告真实的最大已接收流编号
    fn goaway_stream_id(&self) -> u64 {
        match self.drain.state() {
            DrainState::None | DrainState::Pending => Consts::EIGHT_BYTE_LIMIT,
            _ => self.max_incoming_stream_id,
        }
    }

    fn on_goaway_ack(&mut self, sock: &mut dyn QuicSocket) {
        match self.drain.state() {
            DrainState::FirstGoaway => self.send_goaway_frame(sock),
            DrainState::SecondGoaway => self.drain.set(DrainState::Done),
            _ => {}
        }
        self.check_for_shutdown(sock);
    }

    fn v1_check_sending_goaway(&mut self, sock: &mut dyn QuicSocket, msg: &Message) {
        if self.drain.is_none() && msg.has_connection_close() {
            self.notify_pending_shutdown(sock);
        }
        self.drain.v1_close_sent();
    }

    pub fn close_when_idle(&mut self, sock: &mut dyn QuicSocket) {
        self.drain_impl(sock);
        if self.version == Some(HqVersion::H1qV1) {
            self.drain.set(DrainState::Done);
        }
        self.cleanup_pending_streams();
        self.check_for_shutdown(sock);
    }

    pub fn drop_connection(&mut self, sock: &mut dyn QuicSocket) {
        self.drop_connection_with_error(
            sock,
            Http3ErrorCode::NoError,
            "Stopping".to_string(),
            ErrorKind::Dropped,
        );
    }

    pub fn drop_connection_with_error(
        &mut self,
        sock: &mut dyn QuicSocket,
        code: Http3ErrorCode,
        msg: String,
        kind: ErrorKind,
    ) {
        tracing::trace!(parent: &self.span, code = %code, "drop connection");
        // dropping防的是dropConnection->onError->dropConnection的重入
        if self.dropping {
            return;
        }
        self.dropping = true;
        if self.registry.number_of_streams() > 0 {
            sock.close(Some((code, msg.clone())));
            for key in self.registry.collect_keys() {
                if let Some(stream) = self.registry.get_mut(key) {
                    // 套接字已经没了, 在途回调视作全部取消
                    stream.pending_byte_events = 0;
                    stream.active_delivery_callbacks = 0;
                    stream.drain_byte_events();
                }
                let err = ProtError::stream(kind, code, format!("Dropped connection. {}", msg));
                self.error_on_transaction(sock, key, err);
            }
        } else if sock.good() {
            sock.close(None);
        }
        self.drain.set(DrainState::Done);
        self.cleanup_pending_streams();
        self.check_for_shutdown(sock);
    }

    fn cleanup_pending_streams(&mut self) {
        // 前导没读完的流与没绑定上的推送流不再跟踪
        let pending = self.dispatcher.clear();
        for id in pending {
            tracing::trace!(parent: &self.span, stream_id = id, "pending stream cleaned up");
        }
        let mut unbound = Vec::new();
        for push_id in self.registry.lookup.push_ids() {
            if !self.registry.ingress_push.contains_key(&push_id) {
                unbound.push(push_id);
            }
        }
        for push_id in unbound {
            self.registry.lookup.remove_by_push(push_id);
        }
    }

    pub fn check_for_shutdown(&mut self, sock: &mut dyn QuicSocket) {
        // 带控制流的客户端想走就直接把排空置Done,
        // 不用等自己的GOAWAY流程, 还能继续收处理对端的GOAWAY
        if self.direction.is_upstream()
            && self
                .version
                .map(|v| v.uses_control_streams())
                .unwrap_or(false)
            && self.drain.state() == DrainState::Pending
        {
            self.drain.set(DrainState::Done);
        }
        for key in self.registry.collect_keys() {
            self.check_for_detach(sock, key);
        }
        if self.drain.is_done() && self.registry.number_of_streams() == 0 && !self.destroyed {
            if sock.good() {
                sock.close(None);
            }
            self.destroyed = true;
            if let Some(controller) = &mut self.controller {
                controller.on_destroy();
            }
        }
    }

    fn check_for_detach(&mut self, sock: &mut dyn QuicSocket, key: StreamKey) {
        let ready = match self.registry.get(key) {
            Some(stream) => !stream.detached && stream.is_detach_ready(),
            None => return,
        };
        if ready {
            self.cancel_timeout(key);
            let mut handler = None;
            if let Some(stream) = self.registry.get_mut(key) {
                stream.detached = true;
                if !stream.detach_notified {
                    stream.detach_notified = true;
                    handler = stream.handler.take();
                }
            }
            if let Some(mut handler) = handler {
                handler.on_detach();
            }
        }
        let erasable = match self.registry.get(key) {
            Some(stream) => stream.is_erasable(),
            None => return,
        };
        if erasable {
            if let Some(stream) = self.registry.get(key) {
                if let Some(id) = stream.stream_id() {
                    self.pending_read_set.remove(&id);
                    self.deferred_reads.remove(&id);
                    self.egress_queue.clear_pending_egress(id);
                }
            }
            self.cancel_timeout(key);
            self.registry.erase(key);
            if self.registry.number_of_streams() == 0 {
                self.cleanup_pending_streams();
            }
        }
    }

    // ------------------------------------------------------------------
    // 错误处理

    fn on_read_error(
        &mut self,
        sock: &mut dyn QuicSocket,
        id: StreamId,
        err: QuicErrorCode,
    ) -> ProtResult<()> {
        if self.find_control_by_ingress(id).is_some() || self.find_control_by_egress(id).is_some()
        {
            let stream_type = self
                .find_control_by_ingress(id)
                .or_else(|| self.find_control_by_egress(id))
                .unwrap();
            self.handle_session_error(stream_type, err);
            return Ok(());
        }
        let key = match self.registry.key_for_stream_id(id) {
            Some(key) => key,
            None => {
                // 流擦除时回调一并撤了, 基本到不了这
                tracing::trace!(parent: &self.span, stream_id = id, "read error for detached stream");
                return Ok(());
            }
        };
        match err {
            QuicErrorCode::Application(code) => {
                self.on_reset_stream(sock, key, Http3ErrorCode::from_u64(code));
            }
            QuicErrorCode::Local(code) => {
                let kind = if code == LocalErrorCode::ConnectFailed {
                    ErrorKind::Connect
                } else {
                    ErrorKind::Shutdown
                };
                let err = ProtError::stream(kind, Http3ErrorCode::InternalError, "read error");
                self.error_on_transaction(sock, key, err);
            }
            QuicErrorCode::Transport(code) => {
                let err = ProtError::stream(
                    ErrorKind::ConnectionReset,
                    Http3ErrorCode::Unknown(code),
                    "transport read error",
                );
                self.error_on_transaction(sock, key, err);
            }
        }
        Ok(())
    }

    /// 对端RESET的回应策略是方向相关的
    fn on_reset_stream(&mut self, sock: &mut dyn QuicSocket, key: StreamKey, code: Http3ErrorCode) {
        let ingress_started = self
            .registry
            .get(key)
            .map(|s| s.ingress_started)
            .unwrap_or(false);
        let reply = if self.direction.is_upstream() {
            // 上行入向被关, 取消整个请求
            Http3ErrorCode::RequestCancelled
        } else if !ingress_started {
            // 还没消费过入向, 对端可以安全重试
            Http3ErrorCode::RequestRejected
        } else {
            Http3ErrorCode::NoError
        };
        let kind = match code {
            Http3ErrorCode::RequestRejected => ErrorKind::StreamUnacknowledged,
            Http3ErrorCode::GiveupZeroRtt => ErrorKind::EarlyDataFailed,
            _ => ErrorKind::StreamAbort,
        };
        let err = ProtError::stream(kind, code, format!("peer reset, error={}", code));
        self.error_on_transaction(sock, key, err);
        self.send_abort_impl(sock, key, reply);
    }

    fn handle_write_error(&mut self, sock: &mut dyn QuicSocket, key: StreamKey, err: QuicErrorCode) {
        let prot = match err {
            QuicErrorCode::Application(code) => {
                // 应用错误码只能来自对端(大概率STOP_SENDING), 按流中止算
                ProtError::stream_abort(
                    Http3ErrorCode::from_u64(code),
                    "peer aborted stream",
                )
            }
            QuicErrorCode::Local(_) | QuicErrorCode::Transport(_) => ProtError::stream(
                ErrorKind::Write,
                Http3ErrorCode::InternalError,
                "write error",
            ),
        };
        if let Some(id) = self.stream_id_of(key) {
            self.abort_transport_stream(sock, id, true, Http3ErrorCode::RequestCancelled);
        }
        self.error_on_transaction(sock, key, prot);
    }

    /// 控制流上的任何错误都是连接级的, 留到下一轮循环再拆
    fn handle_session_error(&mut self, stream_type: UniStreamType, err: QuicErrorCode) {
        let should_drop = match &err {
            QuicErrorCode::Application(_) => true,
            QuicErrorCode::Local(code) => *code != LocalErrorCode::NoError,
            QuicErrorCode::Transport(code) => *code != 0,
        };
        if !should_drop {
            return;
        }
        let mut app_error = match err {
            QuicErrorCode::Application(code) => Http3ErrorCode::from_u64(code),
            _ => Http3ErrorCode::NoError,
        };
        if app_error == Http3ErrorCode::NoError {
            app_error = Http3ErrorCode::ClosedCriticalStream;
        }
        tracing::trace!(parent: &self.span, stream_type = ?stream_type, "error on control stream");
        if self.drop_in_next_loop.is_none() {
            self.drop_in_next_loop = Some((
                app_error,
                "HTTP error on control stream".to_string(),
                ErrorKind::Connection,
            ));
        }
    }

    fn handle_session_error_prot(&mut self, stream_type: UniStreamType, err: ProtError) {
        let code = err.code().unwrap_or(Http3ErrorCode::ClosedCriticalStream);
        tracing::trace!(parent: &self.span, stream_type = ?stream_type, code = %code, "control stream error");
        if self.drop_in_next_loop.is_none() {
            self.drop_in_next_loop = Some((
                code,
                format!("{}", err),
                ErrorKind::Connection,
            ));
        }
    }

    fn error_on_transaction(&mut self, sock: &mut dyn QuicSocket, key: StreamKey, err: ProtError) {
        let already = match self.registry.get_mut(key) {
            Some(stream) => {
                if stream.detached || stream.errored {
                    true
                } else {
                    stream.errored = true;
                    false
                }
            }
            None => return,
        };
        if !already {
            // 流中止类错误的传输层回应由调用方自己定, 其他错误统一取消该流
            if err.kind() != Some(ErrorKind::StreamAbort) {
                let (stream_id, has_egress) = match self.registry.get(key) {
                    Some(stream) => (stream.stream_id(), stream.egress_id.is_some()),
                    None => (None, false),
                };
                if let Some(id) = stream_id {
                    self.abort_transport_stream(
                        sock,
                        id,
                        has_egress,
                        Http3ErrorCode::RequestCancelled,
                    );
                }
            }
            self.with_handler(sock, key, |handler, _txn| handler.on_error(&err));
        }
        let egress_id = match self.registry.get_mut(key) {
            Some(stream) => {
                stream.abort_ingress();
                stream.abort_egress();
                stream.queue_handle.transport_enqueued = false;
                stream.egress_id
            }
            None => None,
        };
        if let Some(id) = egress_id {
            self.egress_queue.clear_pending_egress(id);
        }
        self.cancel_timeout(key);
    }

    fn on_connection_error(&mut self, sock: &mut dyn QuicSocket, code: QuicErrorCode, msg: String) {
        tracing::trace!(parent: &self.span, msg = %msg, "connection error");
        let kind = match &code {
            QuicErrorCode::Local(LocalErrorCode::ConnectFailed) => ErrorKind::Connect,
            _ => ErrorKind::ConnectionReset,
        };
        let app_code = match code {
            QuicErrorCode::Application(c) => Http3ErrorCode::from_u64(c),
            _ => Http3ErrorCode::NoError,
        };
        self.drop_connection_with_error(sock, app_code, msg, kind);
    }

    // ------------------------------------------------------------------
    // 超时

    fn arm_timeout(&mut self, key: StreamKey) {
        let dur = match self.config.transactions_timeout {
            Some(dur) => dur,
            None => return,
        };
        let timeout_key = self.timeouts.insert(key, dur);
        if let Some(stream) = self.registry.get_mut(key) {
            stream.timeout_key = Some(timeout_key);
        }
    }

    fn reset_timeout(&mut self, key: StreamKey) {
        let dur = match self.config.transactions_timeout {
            Some(dur) => dur,
            None => return,
        };
        if let Some(stream) = self.registry.get(key) {
            if let Some(timeout_key) = &stream.timeout_key {
                self.timeouts.reset(timeout_key, dur);
            }
        }
    }

    fn cancel_timeout(&mut self, key: StreamKey) {
        if let Some(stream) = self.registry.get_mut(key) {
            if let Some(timeout_key) = stream.timeout_key.take() {
                self.timeouts.try_remove(&timeout_key);
            }
        }
    }

    /// 返回是否有超时触发
    pub fn poll_timeouts(&mut self, cx: &mut Context<'_>, sock: &mut dyn QuicSocket) -> bool {
        let mut fired = false;
        loop {
            match self.timeouts.poll_expired(cx) {
                Poll::Ready(Some(expired)) => {
                    fired = true;
                    let key = expired.into_inner();
                    self.transaction_timeout(sock, key);
                }
                _ => return fired,
            }
        }
    }

    fn transaction_timeout(&mut self, sock: &mut dyn QuicSocket, key: StreamKey) {
        let (exists, has_handler, egress_started, ingress_id) = match self.registry.get_mut(key) {
            Some(stream) => {
                stream.timeout_key = None;
                (
                    !stream.detached,
                    stream.handler.is_some(),
                    stream.egress_headers_sent,
                    stream.ingress_id,
                )
            }
            None => return,
        };
        if !exists {
            return;
        }
        tracing::trace!(parent: &self.span, key = ?key, "transaction timeout");
        // 头还没收齐的事务没有处理器, 找控制器借一个兜底
        if !has_handler && !egress_started {
            let handler = match &mut self.controller {
                Some(controller) => Some(controller.timeout_handler()),
                None => None,
            };
            if let Some(handler) = handler {
                if let Some(stream) = self.registry.get_mut(key) {
                    stream.handler = Some(handler);
                }
            }
        }
        if let Some(stream) = self.registry.get_mut(key) {
            stream.abort_ingress();
        }
        if let Some(id) = ingress_id {
            self.abort_transport_stream(sock, id, false, Http3ErrorCode::InternalError);
        }
        self.with_handler(sock, key, |handler, txn| handler.on_timeout(txn));
    }

    /// 连接管理器的空闲超时: 有事务在跑就忽略
    pub fn timeout_expired(&mut self, sock: &mut dyn QuicSocket) {
        if self.registry.number_of_streams() > 0 {
            tracing::trace!(parent: &self.span, "ignoring session timeout");
            return;
        }
        self.close_when_idle(sock);
    }

    // ------------------------------------------------------------------
    // 循环回调

    /// 每轮事件消化完后的统一处理: 先读后写, 控制流优先,
    /// 再检查有没有到了该拆会话的时候
    pub fn run_loop(&mut self, sock: &mut dyn QuicSocket) {
        if self.destroyed {
            return;
        }
        if let Some((code, msg, kind)) = self.drop_in_next_loop.take() {
            self.drop_connection_with_error(sock, code, msg, kind);
            return;
        }

        self.reads_per_loop = 0;
        let deferred: Vec<StreamId> = self.deferred_reads.iter().copied().collect();
        self.deferred_reads.clear();
        for id in deferred {
            let _ = self.read_request_stream(sock, id);
        }

        self.process_read_data(sock);
        self.read_data_processed();

        let budget = self.conn_flow.available();
        let mut spent = 0;
        if budget > 0 {
            spent = self.write_control_streams(sock, budget);
            let remaining = budget - spent;
            if !self.egress_queue.is_empty() && remaining > 0 {
                spent += self.write_request_streams(sock, remaining);
            }
            // 本轮预算用完, 下次写就绪前不再出字节
            self.conn_flow.clear();
        }

        let control_pending = self
            .control_streams
            .values()
            .any(|ctrl| ctrl.write_buf.remaining() > 0);
        // 还有待写数据且是连接预算把我们拦下来的, 才需要再要一次写就绪;
        // 卡在流级窗口上的等流控更新来叫醒
        if (!self.egress_queue.is_empty() || control_pending)
            && (budget == 0 || spent == budget)
        {
            self.schedule_write(sock);
        }

        self.check_for_shutdown(sock);
    }

    /// 读全部处理完后, QPACK该确认的确认, 指令流的数据搬到控制流上
    fn read_data_processed(&mut self) {
        let qpack = match &self.qpack {
            Some(qpack) => qpack.clone(),
            None => return,
        };
        let (enc, dec) = match qpack.write() {
            Ok(mut qpack) => (
                qpack.take_encoder_stream_data(),
                qpack.take_decoder_stream_data(),
            ),
            Err(_) => return,
        };
        if let Some(data) = enc {
            if let Some(ctrl) = self.control_streams.get_mut(&UniStreamType::QpackEncoder) {
                ctrl.write_buf.put_slice(data.chunk());
            }
        }
        if let Some(data) = dec {
            if let Some(ctrl) = self.control_streams.get_mut(&UniStreamType::QpackDecoder) {
                ctrl.write_buf.put_slice(data.chunk());
            }
        }
    }

    pub fn has_pending_work(&self) -> bool {
        !self.pending_read_set.is_empty()
            || !self.deferred_reads.is_empty()
            || self.drop_in_next_loop.is_some()
    }

    // 测试与诊断辅助

    pub fn is_push_lookup_consistent(&self) -> bool {
        self.registry.lookup.is_consistent()
    }

    pub fn stream_write_offset_of(&self, key: StreamKey) -> Option<u64> {
        self.registry.get(key).map(|s| s.stream_write_offset())
    }

    pub fn active_delivery_callbacks_of(&self, key: StreamKey) -> Option<u64> {
        self.registry.get(key).map(|s| s.active_delivery_callbacks)
    }
}
