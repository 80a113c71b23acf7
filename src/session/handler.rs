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

use std::net::SocketAddr;

use webparse::{Binary, HeaderMap};

use crate::codec::Message;
use crate::quic::{QuicSocket, StreamId, StreamTransportInfo, TransportInfo};
use crate::session::{Control, StreamKey};
use crate::{Http3ErrorCode, ProtError, ProtResult};

/// 回调期间借给处理器的事务上下文, 所有发送操作从这里走
pub struct Txn<'a> {
    pub(crate) ctl: &'a mut Control,
    pub(crate) sock: &'a mut dyn QuicSocket,
    pub(crate) key: StreamKey,
}

impl<'a> Txn<'a> {
    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.ctl.stream_id_of(self.key)
    }

    pub fn send_headers(&mut self, msg: Message, include_eom: bool) -> ProtResult<()> {
        self.ctl
            .send_headers(self.sock, self.key, msg, include_eom)
    }

    pub fn send_body(&mut self, data: Binary, include_eom: bool) -> ProtResult<usize> {
        self.ctl.send_body(self.sock, self.key, data, include_eom)
    }

    pub fn send_chunk_header(&mut self, len: usize) -> ProtResult<usize> {
        self.ctl.send_chunk_header(self.sock, self.key, len)
    }

    pub fn send_chunk_terminator(&mut self) -> ProtResult<usize> {
        self.ctl.send_chunk_terminator(self.sock, self.key)
    }

    pub fn send_eom(&mut self) -> ProtResult<usize> {
        self.ctl.send_eom(self.sock, self.key, None)
    }

    pub fn send_eom_with_trailers(&mut self, trailers: HeaderMap) -> ProtResult<usize> {
        self.ctl.send_eom(self.sock, self.key, Some(trailers))
    }

    pub fn send_abort(&mut self, code: Http3ErrorCode) -> ProtResult<()> {
        self.ctl.send_abort(self.sock, self.key, code)
    }

    pub fn pause_ingress(&mut self) {
        self.ctl.pause_ingress(self.sock, self.key)
    }

    pub fn resume_ingress(&mut self) {
        self.ctl.resume_ingress(self.sock, self.key)
    }

    /// 部分可靠: 宣告消息体某偏移前的部分过期, 对应的缓冲丢弃
    pub fn skip_body_to(&mut self, body_offset: u64) -> ProtResult<u64> {
        self.ctl.skip_body_to(self.sock, self.key, body_offset)
    }

    pub fn reject_body_to(&mut self, body_offset: u64) -> ProtResult<u64> {
        self.ctl.reject_body_to(self.sock, self.key, body_offset)
    }

    /// 服务端在当前事务上发起推送, 返回推送流的编号
    pub fn new_pushed_transaction(
        &mut self,
        promise: Message,
        handler: Box<dyn StreamHandler>,
    ) -> ProtResult<StreamId> {
        self.ctl
            .new_pushed_transaction(self.sock, self.key, promise, handler)
    }

    pub fn notify_pending_egress(&mut self) {
        self.ctl.notify_pending_egress(self.sock, self.key)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.sock.peer_addr()
    }

    pub fn transport_info(&self) -> TransportInfo {
        self.sock.transport_info()
    }

    pub fn stream_transport_info(&self) -> ProtResult<StreamTransportInfo> {
        match self.ctl.stream_id_of(self.key) {
            Some(id) => self.sock.stream_transport_info(id),
            None => Err(ProtError::Extension("stream not bound yet")),
        }
    }

    pub fn is_replay_safe(&self) -> bool {
        self.sock.replay_safe()
    }
}

/// 每个事务挂一个处理器, 所有回调在会话所在的循环里同步发生.
/// onError之后一定会跟一个onDetach, 干净完成的才会看到字节事件
pub trait StreamHandler {
    fn on_headers(&mut self, txn: &mut Txn<'_>, msg: Message) {
        let _ = (txn, msg);
    }

    fn on_body(&mut self, txn: &mut Txn<'_>, data: Binary) {
        let _ = (txn, data);
    }

    fn on_chunk_header(&mut self, txn: &mut Txn<'_>, len: usize) {
        let _ = (txn, len);
    }

    fn on_chunk_complete(&mut self, txn: &mut Txn<'_>) {
        let _ = txn;
    }

    fn on_trailers(&mut self, txn: &mut Txn<'_>, trailers: HeaderMap) {
        let _ = (txn, trailers);
    }

    fn on_eom(&mut self, txn: &mut Txn<'_>) {
        let _ = txn;
    }

    /// 收到推送承诺, 返回处理器则接受这个推送
    fn on_push_promise(
        &mut self,
        txn: &mut Txn<'_>,
        push_id: u64,
        msg: &Message,
    ) -> Option<Box<dyn StreamHandler>> {
        let _ = (txn, push_id, msg);
        None
    }

    /// 事务可以继续产出字节, max是当前还放得下的量
    fn on_write_ready(&mut self, txn: &mut Txn<'_>, max: u64) {
        let _ = (txn, max);
    }

    fn on_error(&mut self, err: &ProtError) {
        let _ = err;
    }

    fn on_timeout(&mut self, txn: &mut Txn<'_>) {
        let _ = txn;
    }

    /// 对端排空, 事务自身可以继续跑完
    fn on_goaway(&mut self) {}

    fn on_detach(&mut self) {}

    fn on_body_skipped(&mut self, offset: u64) {
        let _ = offset;
    }

    fn on_body_rejected(&mut self, offset: u64) {
        let _ = offset;
    }

    // 字节事件, 只在干净完成的路径上触发
    fn on_first_header_byte_flushed(&mut self) {}

    fn on_first_body_byte_flushed(&mut self) {}

    fn on_last_byte_flushed(&mut self) {}

    fn on_last_byte_acked(&mut self) {}

    fn on_last_egress_header_byte_acked(&mut self) {}
}

/// 会话级回调: 给新请求派处理器, 给超时且无处理器的事务兜底
pub trait SessionController {
    fn on_request(&mut self, txn: &mut Txn<'_>, msg: &Message) -> Option<Box<dyn StreamHandler>>;

    /// 头部未到齐就超时的事务用这里给的处理器生成错误响应
    fn timeout_handler(&mut self) -> Box<dyn StreamHandler>;

    fn on_destroy(&mut self) {}
}
