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

use std::future::poll_fn;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use crate::codec::HqSettings;
use crate::quic::{QuicSocket, StreamId, TransportInfo};
use crate::session::{
    Builder, Control, Direction, DrainState, SessionController, StreamHandler, StreamKey, Txn,
};
use crate::{ErrorKind, Http3ErrorCode, ProtResult};

/// 一条HTTP-over-QUIC连接: 拥有套接字, 引擎状态在Control里.
/// 所有权都在本地, 驱动方式是反复poll直到会话自然销毁
pub struct HqConnection<T: QuicSocket> {
    sock: T,
    control: Control,
    /// 事件流已经收尾, 不再去轮询
    events_done: bool,
}

unsafe impl<T: QuicSocket + Send> Send for HqConnection<T> {}

unsafe impl<T: QuicSocket + Sync> Sync for HqConnection<T> {}

impl<T: QuicSocket + Unpin> HqConnection<T> {
    /// 服务端(下行)会话
    pub fn server(sock: T, builder: Builder, controller: Box<dyn SessionController>) -> Self {
        HqConnection {
            sock,
            control: Control::new(Direction::Downstream, builder, controller),
            events_done: false,
        }
    }

    /// 客户端(上行)会话
    pub fn client(sock: T, builder: Builder, controller: Box<dyn SessionController>) -> Self {
        HqConnection {
            sock,
            control: Control::new(Direction::Upstream, builder, controller),
            events_done: false,
        }
    }

    pub fn start_now(&mut self) {
        self.control.mark_started();
    }

    /// 推进会话: 先消化传输层事件, 再跑超时与循环回调.
    /// 会话销毁后返回Ready
    pub fn poll_handle(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<()>> {
        loop {
            if self.control.is_destroyed() {
                return Poll::Ready(Ok(()));
            }
            let mut progressed = false;
            while !self.events_done {
                match self.sock.poll_event(cx) {
                    Poll::Ready(Some(event)) => {
                        self.control.on_event(&mut self.sock, event);
                        progressed = true;
                    }
                    Poll::Ready(None) => {
                        // 事件流收尾等价于连接结束
                        self.events_done = true;
                        self.control
                            .on_event(&mut self.sock, crate::quic::QuicEvent::ConnectionEnd);
                        progressed = true;
                    }
                    Poll::Pending => break,
                }
            }
            if self.control.poll_timeouts(cx, &mut self.sock) {
                progressed = true;
            }
            self.control.run_loop(&mut self.sock);
            if self.control.is_destroyed() {
                return Poll::Ready(Ok(()));
            }
            if !progressed {
                return Poll::Pending;
            }
        }
    }

    /// 一直驱动到会话销毁
    pub async fn run(&mut self) -> ProtResult<()> {
        poll_fn(|cx| self.poll_handle(cx)).await
    }

    /// 本端发起一个新事务, 排空中或连接不可用时返回None
    pub fn new_transaction(
        &mut self,
        handler: Box<dyn StreamHandler>,
    ) -> ProtResult<Option<StreamId>> {
        self.control.new_transaction(&mut self.sock, handler)
    }

    /// 回调之外驱动某个事务时从这里借上下文
    pub fn transaction(&mut self, key: StreamKey) -> Option<Txn<'_>> {
        if !self.control.contains_transaction(key) {
            return None;
        }
        Some(Txn {
            ctl: &mut self.control,
            sock: &mut self.sock,
            key,
        })
    }

    // ------------------------------------------------------------------
    // 排空与关闭

    pub fn drain(&mut self) {
        self.notify_pending_shutdown();
    }

    pub fn notify_pending_shutdown(&mut self) {
        self.control.notify_pending_shutdown(&mut self.sock);
    }

    pub fn close_when_idle(&mut self) {
        self.control.close_when_idle(&mut self.sock);
    }

    pub fn drop_connection(&mut self) {
        self.control.drop_connection(&mut self.sock);
    }

    pub fn drop_connection_with_error(&mut self, code: Http3ErrorCode, msg: impl Into<String>) {
        self.control.drop_connection_with_error(
            &mut self.sock,
            code,
            msg.into(),
            ErrorKind::Dropped,
        );
    }

    /// 连接管理器的空闲超时入口
    pub fn timeout_expired(&mut self) {
        self.control.timeout_expired(&mut self.sock);
    }

    // ------------------------------------------------------------------
    // 配置

    pub fn set_egress_settings(&mut self, settings: HqSettings) {
        self.control.set_egress_settings(settings);
    }

    pub fn send_settings(&mut self) -> ProtResult<usize> {
        self.control.send_settings(&mut self.sock)
    }

    pub fn set_flow_control(&mut self, stream_window: u64, session_window: u64) {
        self.control
            .set_flow_control(&mut self.sock, stream_window, session_window);
    }

    pub fn send_ping(&mut self) {
        self.control.send_ping(&mut self.sock);
    }

    /// 调整某条流在出向依赖树里的位置
    pub fn update_priority(&mut self, id: StreamId, depend_id: StreamId, weight: u8) {
        self.control.update_priority(id, depend_id, weight);
    }

    // ------------------------------------------------------------------
    // 查询

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.sock.peer_addr()
    }

    pub fn transport_info(&self) -> TransportInfo {
        self.sock.transport_info()
    }

    pub fn codec_protocol(&self) -> &str {
        self.control.alpn()
    }

    pub fn number_of_streams(&self) -> usize {
        self.control.number_of_streams()
    }

    /// 本端主动开的流: 服务端只有推送流, 客户端是请求流
    pub fn number_of_outgoing_streams(&self) -> usize {
        match self.control.direction() {
            Direction::Downstream => self.control.number_of_egress_push_streams(),
            Direction::Upstream => self.control.number_of_egress_streams(),
        }
    }

    pub fn number_of_incoming_streams(&self) -> usize {
        match self.control.direction() {
            Direction::Upstream => self.control.number_of_ingress_push_streams(),
            Direction::Downstream => self.control.number_of_ingress_streams(),
        }
    }

    pub fn number_of_ingress_push_streams(&self) -> usize {
        self.control.number_of_ingress_push_streams()
    }

    pub fn has_active_transactions(&self) -> bool {
        self.control.number_of_streams() > 0
    }

    pub fn is_reusable(&self) -> bool {
        !self.control.is_closing()
    }

    pub fn is_closing(&self) -> bool {
        self.control.is_closing()
    }

    pub fn drain_state(&self) -> DrainState {
        self.control.drain_state()
    }

    pub fn is_destroyed(&self) -> bool {
        self.control.is_destroyed()
    }

    /// 引擎状态的只读视图, 测试与诊断用
    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn socket(&self) -> &T {
        &self.sock
    }

    pub fn socket_mut(&mut self) -> &mut T {
        &mut self.sock
    }
}
