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
// Created Date: 2023/11/21 09:38:12

use std::{
    net::SocketAddr,
    task::{Context, Poll},
};

use webparse::Binary;

use crate::{Http3ErrorCode, ProtResult};

pub type StreamId = u64;

/// QUIC流编号的低两位编码了方向与发起方
pub fn is_unidirectional(id: StreamId) -> bool {
    id & 0x2 != 0
}

pub fn is_bidirectional(id: StreamId) -> bool {
    !is_unidirectional(id)
}

pub fn is_server_initiated(id: StreamId) -> bool {
    id & 0x1 != 0
}

pub fn is_client_initiated(id: StreamId) -> bool {
    !is_server_initiated(id)
}

/// 本地传输层错误, 区别于对端发来的应用错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalErrorCode {
    NoError,
    ConnectFailed,
    StreamNotExists,
    InternalError,
}

/// 读写错误的来源, 控制流上除NoError外的任何一种都将关闭连接
#[derive(Debug, Clone)]
pub enum QuicErrorCode {
    /// 对端RESET_STREAM/CONNECTION_CLOSE带来的应用错误码
    Application(u64),
    Local(LocalErrorCode),
    Transport(u64),
}

impl QuicErrorCode {
    pub fn is_no_error(&self) -> bool {
        match self {
            QuicErrorCode::Application(_) => false,
            QuicErrorCode::Local(c) => *c == LocalErrorCode::NoError,
            QuicErrorCode::Transport(c) => *c == 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlowControlInfo {
    pub send_window_available: u64,
    pub receive_window_available: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransportInfo {
    pub srtt_us: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_recved: u64,
    pub pto_count: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTransportInfo {
    pub stream_bytes_sent: u64,
    pub stream_bytes_recved: u64,
    pub total_retransmits: u32,
}

/// 传输层上抛的事件, 会话在poll中逐个消费
#[derive(Debug)]
pub enum QuicEvent {
    /// 握手完成, ALPN可用, 会话在此绑定协议变体
    TransportReady,
    ReplaySafe,
    NewBidirectionalStream(StreamId),
    NewUnidirectionalStream(StreamId),
    ReadAvailable(StreamId),
    ReadError(StreamId, QuicErrorCode),
    FlowControlUpdate(StreamId),
    /// 连接可写, 携带本轮的写入预算
    ConnectionWriteReady(u64),
    ConnectionWriteError(QuicErrorCode),
    StopSending(StreamId, u64),
    ConnectionEnd,
    ConnectionError(QuicErrorCode, String),
    DeliveryAck { stream_id: StreamId, offset: u64 },
    DeliveryCanceled { stream_id: StreamId, offset: u64 },
    DataExpired { stream_id: StreamId, offset: u64 },
    DataRejected { stream_id: StreamId, offset: u64 },
}

/// 会话消费的QUIC套接字能力, 重传/拥塞均在传输层内部处理.
/// 所有方法均为同步调用, 事件统一从poll_event取出
pub trait QuicSocket {
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<QuicEvent>>;

    fn good(&self) -> bool;
    fn app_protocol(&self) -> Option<String>;
    fn local_addr(&self) -> Option<SocketAddr>;
    fn peer_addr(&self) -> Option<SocketAddr>;
    fn replay_safe(&self) -> bool;

    fn create_bidirectional_stream(&mut self) -> ProtResult<StreamId>;
    fn create_unidirectional_stream(&mut self) -> ProtResult<StreamId>;

    /// max为0表示读出当前所有可读数据, 返回(数据, 是否EOF)
    fn read(&mut self, id: StreamId, max: usize) -> ProtResult<(Binary, bool)>;
    /// 窥视但不消费, 用于单向流前导解析
    fn peek(&mut self, id: StreamId) -> ProtResult<(Binary, bool)>;
    fn consume(&mut self, id: StreamId, amount: usize) -> ProtResult<()>;
    fn pause_read(&mut self, id: StreamId);
    fn resume_read(&mut self, id: StreamId);

    /// 写入数据, 返回未被接收的部分; want_delivery为真时在写入末尾注册送达回调
    fn write_chain(
        &mut self,
        id: StreamId,
        data: Binary,
        fin: bool,
        want_delivery: bool,
    ) -> ProtResult<Option<Binary>>;
    /// 会话有数据想写, 连接可写时回一个写就绪事件
    fn notify_pending_write(&mut self);
    fn register_delivery_callback(&mut self, id: StreamId, offset: u64) -> ProtResult<()>;

    fn reset_stream(&mut self, id: StreamId, code: Http3ErrorCode) -> ProtResult<()>;
    fn stop_sending(&mut self, id: StreamId, code: Http3ErrorCode) -> ProtResult<()>;
    /// 标记为关键流, 流上出错即视为连接错误
    fn set_control_stream(&mut self, id: StreamId) -> ProtResult<()>;

    fn stream_flow_control(&mut self, id: StreamId) -> ProtResult<FlowControlInfo>;
    fn set_stream_flow_control_window(&mut self, id: StreamId, window: u64);
    fn set_connection_flow_control_window(&mut self, window: u64);
    fn stream_write_offset(&self, id: StreamId) -> ProtResult<u64>;
    fn stream_write_buffered(&self, id: StreamId) -> ProtResult<u64>;

    // 部分可靠传输
    fn send_data_expired(&mut self, id: StreamId, offset: u64) -> ProtResult<u64>;
    fn send_data_rejected(&mut self, id: StreamId, offset: u64) -> ProtResult<u64>;

    fn send_ping(&mut self);
    fn transport_info(&self) -> TransportInfo;
    fn stream_transport_info(&self, id: StreamId) -> ProtResult<StreamTransportInfo>;

    fn close(&mut self, err: Option<(Http3ErrorCode, String)>);
}
