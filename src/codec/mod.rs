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

mod h1;
mod hq;
mod qpack;
mod varint;

use webparse::{Binary, BinaryMut, HeaderMap, Request, Response};

use crate::{Http3ErrorCode, ProtError, ProtResult};

pub use self::h1::H1Codec;
pub use self::hq::{HqControlCodec, HqStreamCodec};
pub use self::qpack::{shared_qpack, Qpack, SharedQpack};
pub use self::varint::{decode_varint, encode_varint, varint_len};

pub type RecvRequest = Request<Binary>;
pub type RecvResponse = Response<Binary>;

/// 头部消息, 会话核心不关心具体方向, 由上层保证请求/响应匹配
#[derive(Debug)]
pub enum Message {
    Request(RecvRequest),
    Response(RecvResponse),
}

impl Message {
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Message::Request(_) => None,
            Message::Response(r) => Some(r.status().as_u16()),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        match self {
            Message::Request(r) => r.headers(),
            Message::Response(r) => r.headers(),
        }
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        match self {
            Message::Request(r) => r.headers_mut(),
            Message::Response(r) => r.headers_mut(),
        }
    }

    /// 是否为最终头部, 1xx的中间响应不算
    pub fn is_final(&self) -> bool {
        match self.status_code() {
            Some(code) => code >= 200,
            None => true,
        }
    }

    /// V1下靠Connection: close头互相宣告排空
    pub fn has_connection_close(&self) -> bool {
        for h in self.headers().iter() {
            if h.0 == "Connection" || h.0 == "connection" {
                if h.1.to_string().to_lowercase().contains("close") {
                    return true;
                }
            }
        }
        false
    }
}

/// 流编解码器上抛的事件, 会话在借用结束后统一路由
#[derive(Debug)]
pub enum CodecEvent {
    MessageBegin,
    HeadersComplete(Message),
    Body(Binary),
    ChunkHeader(usize),
    ChunkComplete,
    Trailers(HeaderMap),
    MessageComplete,
    /// 收到PUSH_PROMISE的开始, 在HeadersComplete前闩住push id
    PushMessageBegin(u64),
    Error(ProtError),
}

/// 控制流编解码器上抛的事件
#[derive(Debug)]
pub enum ControlEvent {
    Settings(HqSettings),
    Goaway { max_stream_id: u64 },
}

/// 会话级设置, HQ下通过控制流上的SETTINGS帧交换
#[derive(Debug, Clone)]
pub struct HqSettings {
    pub header_table_size: u32,
    pub qpack_blocked_streams: u32,
    pub max_header_list_size: u32,
}

impl Default for HqSettings {
    fn default() -> Self {
        use crate::Consts;
        HqSettings {
            header_table_size: Consts::DEFAULT_HEADER_TABLE_SIZE,
            qpack_blocked_streams: Consts::DEFAULT_QPACK_BLOCKED_STREAMS,
            max_header_list_size: Consts::DEFAULT_MAX_HEADER_LIST_SIZE,
        }
    }
}

/// 双向流上的消息编解码器, 每个请求流独占一个.
/// 喂入端返回消耗字节数, 0表示阻塞等待其他流的数据(如QPACK编码流)
pub trait StreamCodec {
    fn on_ingress(&mut self, data: &[u8], events: &mut Vec<CodecEvent>) -> ProtResult<usize>;

    fn on_ingress_eof(&mut self, events: &mut Vec<CodecEvent>) -> ProtResult<()>;

    /// 暂停解析, EOM后到达的多余数据不再喂入
    fn set_parser_paused(&mut self, paused: bool);

    fn generate_headers(
        &mut self,
        buf: &mut BinaryMut,
        msg: &Message,
        include_eom: bool,
    ) -> ProtResult<usize>;

    fn generate_body(
        &mut self,
        buf: &mut BinaryMut,
        data: Binary,
        include_eom: bool,
    ) -> ProtResult<usize>;

    fn generate_chunk_header(&mut self, buf: &mut BinaryMut, len: usize) -> ProtResult<usize>;

    fn generate_chunk_terminator(&mut self, buf: &mut BinaryMut) -> ProtResult<usize>;

    fn generate_trailers(&mut self, buf: &mut BinaryMut, trailers: &HeaderMap)
        -> ProtResult<usize>;

    fn generate_eom(&mut self, buf: &mut BinaryMut) -> ProtResult<usize>;

    fn generate_push_promise(
        &mut self,
        _buf: &mut BinaryMut,
        _push_id: u64,
        _msg: &Message,
    ) -> ProtResult<usize> {
        Err(ProtError::stream_abort(
            Http3ErrorCode::GeneralProtocolError,
            "push promise not supported by this codec",
        ))
    }

    /// V1下表示在下一个消息上带上Connection: close
    fn generate_goaway(&mut self, _buf: &mut BinaryMut) -> ProtResult<usize> {
        Ok(0)
    }

    // 部分可靠传输的偏移换算, 仅HQ支持
    fn on_ingress_data_expired(&mut self, _stream_offset: u64) -> ProtResult<u64> {
        Err(ProtError::stream_abort(
            Http3ErrorCode::GeneralProtocolError,
            "partial reliability not supported",
        ))
    }

    fn on_ingress_data_rejected(&mut self, _stream_offset: u64) -> ProtResult<u64> {
        Err(ProtError::stream_abort(
            Http3ErrorCode::GeneralProtocolError,
            "partial reliability not supported",
        ))
    }

    fn on_egress_body_skip(&mut self, _body_offset: u64) -> ProtResult<u64> {
        Err(ProtError::stream_abort(
            Http3ErrorCode::GeneralProtocolError,
            "partial reliability not supported",
        ))
    }

    fn on_egress_body_reject(&mut self, _body_offset: u64) -> ProtResult<u64> {
        Err(ProtError::stream_abort(
            Http3ErrorCode::GeneralProtocolError,
            "partial reliability not supported",
        ))
    }
}

/// 控制流编解码器, SETTINGS/GOAWAY以及容忍未知帧
pub trait ControlCodec {
    fn on_ingress(&mut self, data: &[u8], events: &mut Vec<ControlEvent>) -> ProtResult<usize>;

    /// 控制流上的EOF本身即为致命错误, 由会话层决定关闭
    fn on_ingress_eof(&mut self) -> ProtResult<()>;

    fn generate_settings(
        &mut self,
        buf: &mut BinaryMut,
        settings: &HqSettings,
    ) -> ProtResult<usize>;

    fn generate_goaway(&mut self, buf: &mut BinaryMut, max_stream_id: u64) -> ProtResult<usize>;
}
