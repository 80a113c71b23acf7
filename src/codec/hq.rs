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
// Created Date: 2023/11/23 14:05:37

use webparse::{Binary, BinaryMut, Buf, BufMut, HeaderMap, Request, Response};

use super::varint::{decode_varint, encode_varint, varint_len};
use super::{CodecEvent, ControlCodec, ControlEvent, HqSettings, Message, SharedQpack, StreamCodec};
use crate::{Consts, Http3ErrorCode, ProtError, ProtResult};

/// 正在流式消费的帧, DATA与未知帧不要求完整到达
struct PartialFrame {
    frame_type: u64,
    remaining: u64,
}

/// (消息体偏移, 流偏移, 长度), 部分可靠传输换算用
#[derive(Debug, Clone, Copy)]
struct BodySegment {
    body_start: u64,
    stream_start: u64,
    len: u64,
}

/// HTTP/3请求流/推送流上的消息编解码器
pub struct HqStreamCodec {
    stream_id: u64,
    /// 服务端把收到的头解析为请求, 客户端解析为响应
    decode_request: bool,
    qpack: SharedQpack,

    paused: bool,
    msg_begun: bool,
    headers_done: bool,
    eom_emitted: bool,
    cur_frame: Option<PartialFrame>,

    ingress_stream_offset: u64,
    ingress_body_len: u64,
    ingress_segs: Vec<BodySegment>,

    egress_stream_offset: u64,
    egress_body_len: u64,
    egress_segs: Vec<BodySegment>,
}

impl HqStreamCodec {
    pub fn new(stream_id: u64, decode_request: bool, qpack: SharedQpack) -> Self {
        HqStreamCodec {
            stream_id,
            decode_request,
            qpack,
            paused: false,
            msg_begun: false,
            headers_done: false,
            eom_emitted: false,
            cur_frame: None,
            ingress_stream_offset: 0,
            ingress_body_len: 0,
            ingress_segs: Vec::new(),
            egress_stream_offset: 0,
            egress_body_len: 0,
            egress_segs: Vec::new(),
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn qpack_fields(msg: &Message) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        match msg {
            Message::Request(req) => {
                fields.push((":method".to_string(), req.method().as_str().to_string()));
                fields.push((":path".to_string(), req.path().clone()));
                let scheme = req.scheme().as_str().to_string();
                if !scheme.is_empty() {
                    fields.push((":scheme".to_string(), scheme));
                }
                if let Some(host) = req.get_host() {
                    if !host.is_empty() {
                        fields.push((":authority".to_string(), host));
                    }
                }
                for h in req.headers().iter() {
                    if h.0 == "Host" {
                        continue;
                    }
                    fields.push((h.0.to_string().to_lowercase(), h.1.to_string()));
                }
            }
            Message::Response(res) => {
                fields.push((":status".to_string(), res.status().as_u16().to_string()));
                for h in res.headers().iter() {
                    fields.push((h.0.to_string().to_lowercase(), h.1.to_string()));
                }
            }
        }
        fields
    }

    fn build_request_message(fields: Vec<(String, String)>) -> ProtResult<Message> {
        let mut method = String::new();
        let mut path = String::from("/");
        let mut scheme = String::new();
        let mut authority = String::new();
        let mut builder = Request::builder();
        for (name, value) in fields {
            match &*name {
                ":method" => method = value,
                ":path" => path = value,
                ":scheme" => scheme = value,
                ":authority" => authority = value,
                _ => builder = builder.header(name, value),
            }
        }
        let url = if !authority.is_empty() {
            let scheme = if scheme.is_empty() { "https" } else { &scheme };
            format!("{}://{}{}", scheme, authority, path)
        } else {
            path
        };
        let req = builder.method(&*method).url(&*url).body(Binary::new())?;
        Ok(Message::Request(req))
    }

    fn build_message(&self, fields: Vec<(String, String)>) -> ProtResult<Message> {
        if self.decode_request {
            Self::build_request_message(fields)
        } else {
            let mut status = 200u16;
            let mut builder = Response::builder();
            for (name, value) in fields {
                match &*name {
                    ":status" => status = value.parse().unwrap_or(200),
                    _ => builder = builder.header(name, value),
                }
            }
            let res = builder.status(status).body(Binary::new())?;
            Ok(Message::Response(res))
        }
    }

    fn fields_to_headers(fields: Vec<(String, String)>) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in fields {
            map.insert(name, value);
        }
        map
    }

    fn decode_block(&mut self, block: &[u8]) -> ProtResult<Option<Vec<(String, String)>>> {
        let mut qpack = self
            .qpack
            .write()
            .map_err(|_| ProtError::Extension("qpack lock poisoned"))?;
        qpack.decode_field_section(block)
    }

    fn encode_block(&mut self, fields: &[(String, String)]) -> ProtResult<Binary> {
        let mut qpack = self
            .qpack
            .write()
            .map_err(|_| ProtError::Extension("qpack lock poisoned"))?;
        Ok(qpack.encode_field_section(fields))
    }

    fn put_frame_header(buf: &mut BinaryMut, frame_type: u64, len: u64) -> usize {
        encode_varint(buf, frame_type);
        encode_varint(buf, len);
        varint_len(frame_type) + varint_len(len)
    }
}

impl StreamCodec for HqStreamCodec {
    fn on_ingress(&mut self, data: &[u8], events: &mut Vec<CodecEvent>) -> ProtResult<usize> {
        if self.paused {
            return Ok(0);
        }
        let mut pos = 0usize;
        loop {
            // 未读完的DATA/未知帧继续流式消费
            if let Some(frame) = &mut self.cur_frame {
                let avail = (data.len() - pos).min(frame.remaining as usize);
                if avail == 0 {
                    break;
                }
                if frame.frame_type == Consts::FRAME_DATA {
                    let body = Binary::from(data[pos..pos + avail].to_vec());
                    self.ingress_segs.push(BodySegment {
                        body_start: self.ingress_body_len,
                        stream_start: self.ingress_stream_offset + pos as u64,
                        len: avail as u64,
                    });
                    self.ingress_body_len += avail as u64;
                    events.push(CodecEvent::Body(body));
                }
                frame.remaining -= avail as u64;
                if frame.remaining == 0 {
                    self.cur_frame = None;
                }
                pos += avail;
                continue;
            }

            let rest = &data[pos..];
            let (frame_type, n1) = match decode_varint(rest) {
                Some(v) => v,
                None => break,
            };
            let (len, n2) = match decode_varint(&rest[n1..]) {
                Some(v) => v,
                None => break,
            };
            let header_len = n1 + n2;
            match frame_type {
                t if t == Consts::FRAME_DATA => {
                    if !self.msg_begun {
                        events.push(CodecEvent::Error(ProtError::stream_abort(
                            Http3ErrorCode::GeneralProtocolError,
                            "DATA frame before HEADERS",
                        )));
                        self.paused = true;
                        return Ok(pos);
                    }
                    pos += header_len;
                    self.cur_frame = Some(PartialFrame {
                        frame_type,
                        remaining: len,
                    });
                }
                t if t == Consts::FRAME_HEADERS => {
                    if rest.len() < header_len + len as usize {
                        break;
                    }
                    let block = &rest[header_len..header_len + len as usize];
                    let fields = match self.decode_block(block)? {
                        Some(fields) => fields,
                        // 引用的动态表项还未从编码指令流到达, 整帧留到下次
                        None => break,
                    };
                    if !self.headers_done {
                        if !self.msg_begun {
                            self.msg_begun = true;
                            events.push(CodecEvent::MessageBegin);
                        }
                        let msg = self.build_message(fields)?;
                        let is_final = msg.is_final();
                        events.push(CodecEvent::HeadersComplete(msg));
                        self.headers_done = is_final;
                    } else {
                        events.push(CodecEvent::Trailers(Self::fields_to_headers(fields)));
                    }
                    pos += header_len + len as usize;
                }
                t if t == Consts::FRAME_PUSH_PROMISE => {
                    if self.decode_request {
                        events.push(CodecEvent::Error(ProtError::connection(
                            Http3ErrorCode::GeneralProtocolError,
                            "PUSH_PROMISE on downstream request stream",
                        )));
                        self.paused = true;
                        return Ok(pos);
                    }
                    if rest.len() < header_len + len as usize {
                        break;
                    }
                    let payload = &rest[header_len..header_len + len as usize];
                    let (push_id, pn) = match decode_varint(payload) {
                        Some(v) => v,
                        None => {
                            events.push(CodecEvent::Error(ProtError::connection(
                                Http3ErrorCode::MalformedFramePushPromise,
                                "malformed push promise",
                            )));
                            self.paused = true;
                            return Ok(pos);
                        }
                    };
                    let fields = match self.decode_block(&payload[pn..])? {
                        Some(fields) => fields,
                        None => break,
                    };
                    events.push(CodecEvent::PushMessageBegin(push_id));
                    // 推送承诺里携带的是请求头
                    let msg = Self::build_request_message(fields)?;
                    events.push(CodecEvent::HeadersComplete(msg));
                    pos += header_len + len as usize;
                }
                t if t == Consts::FRAME_SETTINGS
                    || t == Consts::FRAME_GOAWAY
                    || t == Consts::FRAME_MAX_PUSH_ID
                    || t == Consts::FRAME_CANCEL_PUSH =>
                {
                    events.push(CodecEvent::Error(ProtError::connection(
                        Http3ErrorCode::GeneralProtocolError,
                        "control frame on request stream",
                    )));
                    self.paused = true;
                    return Ok(pos);
                }
                _ => {
                    // 未知帧类型直接跳过
                    pos += header_len;
                    self.cur_frame = Some(PartialFrame {
                        frame_type,
                        remaining: len,
                    });
                }
            }
        }
        self.ingress_stream_offset += pos as u64;
        Ok(pos)
    }

    fn on_ingress_eof(&mut self, events: &mut Vec<CodecEvent>) -> ProtResult<()> {
        if self.eom_emitted {
            return Ok(());
        }
        if self.cur_frame.is_some() {
            events.push(CodecEvent::Error(ProtError::stream_abort(
                Http3ErrorCode::GeneralProtocolError,
                "eof inside frame",
            )));
            return Ok(());
        }
        self.eom_emitted = true;
        self.paused = true;
        events.push(CodecEvent::MessageComplete);
        Ok(())
    }

    fn set_parser_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    fn generate_headers(
        &mut self,
        buf: &mut BinaryMut,
        msg: &Message,
        _include_eom: bool,
    ) -> ProtResult<usize> {
        let fields = Self::qpack_fields(msg);
        let block = self.encode_block(&fields)?;
        let header = Self::put_frame_header(buf, Consts::FRAME_HEADERS, block.remaining() as u64);
        let size = header + block.remaining();
        buf.put_slice(block.chunk());
        self.egress_stream_offset += size as u64;
        log::trace!("HTTP3:编码头部帧 stream={} size={}", self.stream_id, size);
        Ok(size)
    }

    fn generate_body(
        &mut self,
        buf: &mut BinaryMut,
        data: Binary,
        _include_eom: bool,
    ) -> ProtResult<usize> {
        if data.remaining() == 0 {
            return Ok(0);
        }
        let header = Self::put_frame_header(buf, Consts::FRAME_DATA, data.remaining() as u64);
        self.egress_segs.push(BodySegment {
            body_start: self.egress_body_len,
            stream_start: self.egress_stream_offset + header as u64,
            len: data.remaining() as u64,
        });
        self.egress_body_len += data.remaining() as u64;
        let size = header + data.remaining();
        buf.put_slice(data.chunk());
        self.egress_stream_offset += size as u64;
        Ok(size)
    }

    fn generate_chunk_header(&mut self, _buf: &mut BinaryMut, _len: usize) -> ProtResult<usize> {
        // HTTP/3本身分帧, chunk标记不落盘
        Ok(0)
    }

    fn generate_chunk_terminator(&mut self, _buf: &mut BinaryMut) -> ProtResult<usize> {
        Ok(0)
    }

    fn generate_trailers(
        &mut self,
        buf: &mut BinaryMut,
        trailers: &HeaderMap,
    ) -> ProtResult<usize> {
        let mut fields = Vec::new();
        for h in trailers.iter() {
            fields.push((h.0.to_string().to_lowercase(), h.1.to_string()));
        }
        let block = self.encode_block(&fields)?;
        let header = Self::put_frame_header(buf, Consts::FRAME_HEADERS, block.remaining() as u64);
        let size = header + block.remaining();
        buf.put_slice(block.chunk());
        self.egress_stream_offset += size as u64;
        Ok(size)
    }

    fn generate_eom(&mut self, _buf: &mut BinaryMut) -> ProtResult<usize> {
        // 消息结束由传输层FIN表达
        Ok(0)
    }

    fn generate_push_promise(
        &mut self,
        buf: &mut BinaryMut,
        push_id: u64,
        msg: &Message,
    ) -> ProtResult<usize> {
        let fields = Self::qpack_fields(msg);
        let block = self.encode_block(&fields)?;
        let payload_len = varint_len(push_id) + block.remaining();
        let header = Self::put_frame_header(buf, Consts::FRAME_PUSH_PROMISE, payload_len as u64);
        encode_varint(buf, push_id);
        buf.put_slice(block.chunk());
        let size = header + payload_len;
        self.egress_stream_offset += size as u64;
        Ok(size)
    }

    /// 接收方: 对端宣告过期的是本端入向数据
    fn on_ingress_data_expired(&mut self, stream_offset: u64) -> ProtResult<u64> {
        map_stream_to_body(
            &self.ingress_segs,
            self.ingress_stream_offset,
            self.ingress_body_len,
            stream_offset,
        )
    }

    /// 发送方: 对端拒绝的是本端出向数据
    fn on_ingress_data_rejected(&mut self, stream_offset: u64) -> ProtResult<u64> {
        map_stream_to_body(
            &self.egress_segs,
            self.egress_stream_offset,
            self.egress_body_len,
            stream_offset,
        )
    }

    fn on_egress_body_skip(&mut self, body_offset: u64) -> ProtResult<u64> {
        let offset = map_body_to_stream(
            &self.egress_segs,
            self.egress_stream_offset,
            self.egress_body_len,
            body_offset,
        )?;
        if body_offset > self.egress_body_len {
            // 跳过了尚未生成的消息体, 把流偏移一并前移
            self.egress_stream_offset += body_offset - self.egress_body_len;
            self.egress_body_len = body_offset;
        }
        Ok(offset)
    }

    /// 接收方拒绝自己入向的消息体前缀
    fn on_egress_body_reject(&mut self, body_offset: u64) -> ProtResult<u64> {
        map_body_to_stream(
            &self.ingress_segs,
            self.ingress_stream_offset,
            self.ingress_body_len,
            body_offset,
        )
    }
}

fn offset_err() -> ProtError {
    ProtError::stream_abort(Http3ErrorCode::GeneralProtocolError, "invalid body offset")
}

/// 消息体偏移换算为流偏移, 超出已生成部分的按线性延伸
fn map_body_to_stream(
    segs: &[BodySegment],
    stream_end: u64,
    body_end: u64,
    body_offset: u64,
) -> ProtResult<u64> {
    if body_offset >= body_end {
        return Ok(stream_end + (body_offset - body_end));
    }
    for seg in segs {
        if body_offset >= seg.body_start && body_offset < seg.body_start + seg.len {
            return Ok(seg.stream_start + (body_offset - seg.body_start));
        }
    }
    Err(offset_err())
}

fn map_stream_to_body(
    segs: &[BodySegment],
    stream_end: u64,
    body_end: u64,
    stream_offset: u64,
) -> ProtResult<u64> {
    if stream_offset >= stream_end {
        return Ok(body_end + (stream_offset - stream_end));
    }
    for seg in segs {
        if stream_offset >= seg.stream_start && stream_offset < seg.stream_start + seg.len {
            return Ok(seg.body_start + (stream_offset - seg.stream_start));
        }
    }
    Err(offset_err())
}

/// 控制流上的SETTINGS/GOAWAY编解码, 对未知帧保持容忍
pub struct HqControlCodec {
    cur_skip: Option<u64>,
}

impl HqControlCodec {
    pub fn new() -> Self {
        HqControlCodec { cur_skip: None }
    }
}

impl ControlCodec for HqControlCodec {
    fn on_ingress(&mut self, data: &[u8], events: &mut Vec<ControlEvent>) -> ProtResult<usize> {
        let mut pos = 0usize;
        loop {
            if let Some(remaining) = &mut self.cur_skip {
                let avail = (data.len() - pos).min(*remaining as usize);
                if avail == 0 {
                    break;
                }
                *remaining -= avail as u64;
                pos += avail;
                if *remaining == 0 {
                    self.cur_skip = None;
                }
                continue;
            }
            let rest = &data[pos..];
            let (frame_type, n1) = match decode_varint(rest) {
                Some(v) => v,
                None => break,
            };
            let (len, n2) = match decode_varint(&rest[n1..]) {
                Some(v) => v,
                None => break,
            };
            let header_len = n1 + n2;
            match frame_type {
                t if t == Consts::FRAME_SETTINGS => {
                    if rest.len() < header_len + len as usize {
                        break;
                    }
                    let mut payload = &rest[header_len..header_len + len as usize];
                    let mut settings = HqSettings::default();
                    while !payload.is_empty() {
                        let (id, n) = decode_varint(payload).ok_or_else(settings_err)?;
                        payload = &payload[n..];
                        let (value, n) = decode_varint(payload).ok_or_else(settings_err)?;
                        payload = &payload[n..];
                        match id {
                            i if i == Consts::SETTING_QPACK_MAX_TABLE_CAPACITY => {
                                settings.header_table_size = value as u32;
                            }
                            i if i == Consts::SETTING_QPACK_BLOCKED_STREAMS => {
                                settings.qpack_blocked_streams = value as u32;
                            }
                            i if i == Consts::SETTING_MAX_FIELD_SECTION_SIZE => {
                                settings.max_header_list_size = value as u32;
                            }
                            _ => {}
                        }
                    }
                    events.push(ControlEvent::Settings(settings));
                    pos += header_len + len as usize;
                }
                t if t == Consts::FRAME_GOAWAY => {
                    if rest.len() < header_len + len as usize {
                        break;
                    }
                    let payload = &rest[header_len..header_len + len as usize];
                    let (max_stream_id, _) = decode_varint(payload).ok_or_else(settings_err)?;
                    events.push(ControlEvent::Goaway { max_stream_id });
                    pos += header_len + len as usize;
                }
                t if t == Consts::FRAME_DATA || t == Consts::FRAME_HEADERS => {
                    return Err(ProtError::connection(
                        Http3ErrorCode::GeneralProtocolError,
                        "message frame on control stream",
                    ));
                }
                _ => {
                    pos += header_len;
                    self.cur_skip = Some(len);
                }
            }
        }
        Ok(pos)
    }

    fn on_ingress_eof(&mut self) -> ProtResult<()> {
        Err(ProtError::connection(
            Http3ErrorCode::ClosedCriticalStream,
            "eof on control stream",
        ))
    }

    fn generate_settings(
        &mut self,
        buf: &mut BinaryMut,
        settings: &HqSettings,
    ) -> ProtResult<usize> {
        let mut payload = BinaryMut::new();
        encode_varint(&mut payload, Consts::SETTING_QPACK_MAX_TABLE_CAPACITY);
        encode_varint(&mut payload, settings.header_table_size as u64);
        encode_varint(&mut payload, Consts::SETTING_QPACK_BLOCKED_STREAMS);
        encode_varint(&mut payload, settings.qpack_blocked_streams as u64);
        encode_varint(&mut payload, Consts::SETTING_MAX_FIELD_SECTION_SIZE);
        encode_varint(&mut payload, settings.max_header_list_size as u64);
        encode_varint(buf, Consts::FRAME_SETTINGS);
        encode_varint(buf, payload.remaining() as u64);
        let size = varint_len(Consts::FRAME_SETTINGS)
            + varint_len(payload.remaining() as u64)
            + payload.remaining();
        buf.put_slice(payload.chunk());
        log::trace!("HTTP3:编码SETTINGS帧 size={}", size);
        Ok(size)
    }

    fn generate_goaway(&mut self, buf: &mut BinaryMut, max_stream_id: u64) -> ProtResult<usize> {
        encode_varint(buf, Consts::FRAME_GOAWAY);
        encode_varint(buf, varint_len(max_stream_id) as u64);
        encode_varint(buf, max_stream_id);
        log::trace!("HTTP3:编码GOAWAY帧 max_stream_id={}", max_stream_id);
        Ok(varint_len(Consts::FRAME_GOAWAY)
            + varint_len(varint_len(max_stream_id) as u64)
            + varint_len(max_stream_id))
    }
}

fn settings_err() -> ProtError {
    ProtError::connection(
        Http3ErrorCode::GeneralProtocolError,
        "malformed control frame",
    )
}
