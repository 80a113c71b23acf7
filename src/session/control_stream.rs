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

use webparse::{BinaryMut, Buf};

use crate::codec::{encode_varint, HqControlCodec};
use crate::quic::StreamId;
use crate::session::UniStreamType;

/// 控制流先以出向流建立, 读到对端前导后再挂上入向部分.
/// QPACK编码/解码流的载荷直达共享QPACK状态, 不走帧编解码器
pub struct ControlStream {
    pub stream_type: UniStreamType,
    pub egress_id: StreamId,
    pub ingress_id: Option<StreamId>,
    pub write_buf: BinaryMut,
    pub read_buf: BinaryMut,
    pub read_eof: bool,
    pub egress_codec: Option<HqControlCodec>,
    pub ingress_codec: Option<HqControlCodec>,
    /// GOAWAY送达回调在途数
    pub pending_delivery: usize,
    pub bytes_written: u64,
}

impl ControlStream {
    pub fn new(stream_type: UniStreamType, egress_id: StreamId) -> Self {
        let egress_codec = match stream_type {
            UniStreamType::Control => Some(HqControlCodec::new()),
            // QPACK指令流的内容由共享状态产出
            _ => None,
        };
        let mut stream = ControlStream {
            stream_type,
            egress_id,
            ingress_id: None,
            write_buf: BinaryMut::new(),
            read_buf: BinaryMut::new(),
            read_eof: false,
            egress_codec,
            ingress_codec: None,
            pending_delivery: 0,
            bytes_written: 0,
        };
        stream.generate_stream_preface();
        stream
    }

    fn generate_stream_preface(&mut self) {
        encode_varint(&mut self.write_buf, self.stream_type.preface_value());
    }

    pub fn set_ingress(&mut self, id: StreamId) {
        self.ingress_id = Some(id);
        if self.stream_type == UniStreamType::Control {
            self.ingress_codec = Some(HqControlCodec::new());
        }
    }

    pub fn is_using(&self, id: StreamId) -> bool {
        self.egress_id == id || self.ingress_id == Some(id)
    }

    pub fn has_ingress(&self) -> bool {
        self.ingress_id.is_some()
    }

    /// 含缓冲在内的写偏移, 送达回调按它注册
    pub fn stream_write_offset(&self) -> u64 {
        self.bytes_written + self.write_buf.remaining() as u64
    }
}
