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
// Created Date: 2023/11/22 10:11:46

use webparse::{Binary, BinaryMut, Buf, BufMut, HeaderMap, Request, Response};

use super::{CodecEvent, Message, StreamCodec};
use crate::{Http3ErrorCode, ProtError, ProtResult};

/// 包体读取方式
enum BodyState {
    /// 还在等消息头
    Headers,
    /// 按Content-Length读取剩余字节
    Length(u64),
    /// 读到流结束
    UntilEof,
    /// chunked编码, 参数为当前chunk剩余与是否在读chunk头
    Chunked { remaining: u64, in_chunk: bool },
    Done,
}

/// V1/V2桥接变体下每个请求流一个HTTP/1.1编解码器.
/// 与真正的HTTP/1.1不同的是消息结束同样可以由流FIN表达
pub struct H1Codec {
    decode_request: bool,
    read_buf: BinaryMut,
    state: BodyState,
    msg_begun: bool,
    eom_emitted: bool,
    paused: bool,

    /// 排空时在下一个消息上带Connection: close
    close_latched: bool,
    close_sent: bool,
    chunked_egress: bool,
}

impl H1Codec {
    pub fn new(decode_request: bool) -> Self {
        H1Codec {
            decode_request,
            read_buf: BinaryMut::new(),
            state: BodyState::Headers,
            msg_begun: false,
            eom_emitted: false,
            paused: false,
            close_latched: false,
            close_sent: false,
            chunked_egress: false,
        }
    }

    fn emit_complete(&mut self, events: &mut Vec<CodecEvent>) {
        if !self.eom_emitted {
            self.eom_emitted = true;
            self.paused = true;
            self.state = BodyState::Done;
            events.push(CodecEvent::MessageComplete);
        }
    }

    fn parse_headers(&mut self, events: &mut Vec<CodecEvent>) -> ProtResult<bool> {
        let (msg, size, body_state) = if self.decode_request {
            let mut request = Request::new();
            let size = match request.parse_buffer(&mut self.read_buf.clone()) {
                Ok(n) => n,
                Err(e) => {
                    if e.is_partial() {
                        return Ok(false);
                    }
                    return Err(e.into());
                }
            };
            if request.is_partial() {
                return Ok(false);
            }
            let state = Self::body_state_for(
                request.get_body_len(),
                request.headers().is_chunked(),
                request.method().is_nobody(),
            );
            (Message::Request(request.into(Binary::new()).0), size, state)
        } else {
            let mut response = Response::new(());
            let size = match response.parse_buffer(&mut self.read_buf.clone()) {
                Ok(n) => n,
                Err(e) => {
                    if e.is_partial() {
                        return Ok(false);
                    }
                    return Err(e.into());
                }
            };
            if response.is_partial() {
                return Ok(false);
            }
            let state = Self::body_state_for(
                response.get_body_len(),
                response.headers().is_chunked(),
                false,
            );
            (Message::Response(response.into(Binary::new()).0), size, state)
        };
        self.read_buf.advance(size);
        if !self.msg_begun {
            self.msg_begun = true;
            events.push(CodecEvent::MessageBegin);
        }
        events.push(CodecEvent::HeadersComplete(msg));
        self.state = body_state;
        if let BodyState::Done = self.state {
            self.emit_complete(events);
        }
        Ok(true)
    }

    fn body_state_for(body_len: isize, is_chunked: bool, no_body: bool) -> BodyState {
        if is_chunked {
            BodyState::Chunked {
                remaining: 0,
                in_chunk: false,
            }
        } else if body_len > 0 {
            BodyState::Length(body_len as u64)
        } else if body_len == 0 && no_body {
            BodyState::Done
        } else {
            // 长度未知, 流上读到FIN为止
            BodyState::UntilEof
        }
    }

    fn take_body(&mut self, max: u64) -> Binary {
        let take = (self.read_buf.remaining() as u64).min(max) as usize;
        let data = Binary::from(self.read_buf.chunk()[..take].to_vec());
        self.read_buf.advance(take);
        data
    }

    /// 从缓冲找一行"\r\n", 返回行内容
    fn take_line(&mut self) -> Option<String> {
        let buf = self.read_buf.chunk();
        let pos = buf.windows(2).position(|w| w == b"\r\n")?;
        let line = String::from_utf8_lossy(&buf[..pos]).to_string();
        self.read_buf.advance(pos + 2);
        Some(line)
    }

    fn process_buffer(&mut self, events: &mut Vec<CodecEvent>) -> ProtResult<()> {
        loop {
            match &mut self.state {
                BodyState::Headers => {
                    if self.read_buf.remaining() == 0 || !self.parse_headers(events)? {
                        return Ok(());
                    }
                }
                BodyState::Length(remaining) => {
                    if self.read_buf.remaining() == 0 {
                        return Ok(());
                    }
                    let max = *remaining;
                    let data = self.take_body(max);
                    let got = data.remaining() as u64;
                    events.push(CodecEvent::Body(data));
                    match &mut self.state {
                        BodyState::Length(remaining) => {
                            *remaining -= got;
                            if *remaining == 0 {
                                self.emit_complete(events);
                                return Ok(());
                            }
                        }
                        _ => unreachable!(),
                    }
                }
                BodyState::UntilEof => {
                    if self.read_buf.remaining() == 0 {
                        return Ok(());
                    }
                    let data = self.take_body(u64::MAX);
                    events.push(CodecEvent::Body(data));
                }
                BodyState::Chunked { remaining, in_chunk } => {
                    if *in_chunk {
                        if self.read_buf.remaining() == 0 {
                            return Ok(());
                        }
                        if *remaining == 0 {
                            // chunk末尾的\r\n
                            if self.read_buf.remaining() < 2 {
                                return Ok(());
                            }
                            self.read_buf.advance(2);
                            self.state = BodyState::Chunked {
                                remaining: 0,
                                in_chunk: false,
                            };
                            events.push(CodecEvent::ChunkComplete);
                            continue;
                        }
                        let max = *remaining;
                        let data = self.take_body(max);
                        let got = data.remaining() as u64;
                        events.push(CodecEvent::Body(data));
                        match &mut self.state {
                            BodyState::Chunked { remaining, .. } => *remaining -= got,
                            _ => unreachable!(),
                        }
                    } else {
                        let line = match self.take_line() {
                            Some(line) => line,
                            None => return Ok(()),
                        };
                        let size = u64::from_str_radix(line.trim(), 16).map_err(|_| {
                            ProtError::stream_abort(
                                Http3ErrorCode::GeneralProtocolError,
                                "bad chunk size",
                            )
                        })?;
                        if size == 0 {
                            // 末尾chunk, 吃掉结尾空行
                            let _ = self.take_line();
                            self.emit_complete(events);
                            return Ok(());
                        }
                        events.push(CodecEvent::ChunkHeader(size as usize));
                        self.state = BodyState::Chunked {
                            remaining: size,
                            in_chunk: true,
                        };
                    }
                }
                BodyState::Done => return Ok(()),
            }
        }
    }

    fn serialize_headers(
        &mut self,
        buf: &mut BinaryMut,
        msg: &Message,
        extra_close: bool,
    ) -> usize {
        let mut out = BinaryMut::new();
        match msg {
            Message::Request(req) => {
                out.put_slice(
                    format!("{} {} HTTP/1.1\r\n", req.method().as_str(), req.path()).as_bytes(),
                );
                if let Some(host) = req.get_host() {
                    if !host.is_empty() && !req.headers().contains(&"Host".to_string()) {
                        out.put_slice(format!("Host: {}\r\n", host).as_bytes());
                    }
                }
            }
            Message::Response(res) => {
                out.put_slice(
                    format!(
                        "HTTP/1.1 {} {}\r\n",
                        res.status().as_u16(),
                        reason_phrase(res.status().as_u16())
                    )
                    .as_bytes(),
                );
            }
        }
        for h in msg.headers().iter() {
            out.put_slice(format!("{}: {}\r\n", h.0, h.1).as_bytes());
        }
        if extra_close {
            out.put_slice(b"Connection: close\r\n");
        }
        out.put_slice(b"\r\n");
        let size = out.remaining();
        buf.put_slice(out.chunk());
        size
    }
}

impl StreamCodec for H1Codec {
    fn on_ingress(&mut self, data: &[u8], events: &mut Vec<CodecEvent>) -> ProtResult<usize> {
        if self.paused {
            return Ok(0);
        }
        self.read_buf.put_slice(data);
        self.process_buffer(events)?;
        // 数据都进了内部缓冲, 对外始终视为全部消耗
        Ok(data.len())
    }

    fn on_ingress_eof(&mut self, events: &mut Vec<CodecEvent>) -> ProtResult<()> {
        match self.state {
            BodyState::UntilEof => self.emit_complete(events),
            BodyState::Done => {}
            BodyState::Headers if !self.msg_begun => {
                // 空流, 没有消息
                self.emit_complete(events);
            }
            _ => {
                events.push(CodecEvent::Error(ProtError::stream_abort(
                    Http3ErrorCode::GeneralProtocolError,
                    "eof inside message",
                )));
            }
        }
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
        let extra_close = self.close_latched && !self.close_sent && !msg.has_connection_close();
        if self.close_latched {
            self.close_sent = true;
        }
        let size = self.serialize_headers(buf, msg, extra_close);
        log::trace!("HTTP1:编码头部 size={}", size);
        Ok(size)
    }

    fn generate_body(
        &mut self,
        buf: &mut BinaryMut,
        data: Binary,
        _include_eom: bool,
    ) -> ProtResult<usize> {
        let size = data.remaining();
        buf.put_slice(data.chunk());
        Ok(size)
    }

    fn generate_chunk_header(&mut self, buf: &mut BinaryMut, len: usize) -> ProtResult<usize> {
        self.chunked_egress = true;
        let line = format!("{:x}\r\n", len);
        buf.put_slice(line.as_bytes());
        Ok(line.len())
    }

    fn generate_chunk_terminator(&mut self, buf: &mut BinaryMut) -> ProtResult<usize> {
        buf.put_slice(b"\r\n");
        Ok(2)
    }

    fn generate_trailers(
        &mut self,
        _buf: &mut BinaryMut,
        _trailers: &HeaderMap,
    ) -> ProtResult<usize> {
        // HTTP/1.1桥接不传trailer
        Ok(0)
    }

    fn generate_eom(&mut self, buf: &mut BinaryMut) -> ProtResult<usize> {
        if self.chunked_egress {
            buf.put_slice(b"0\r\n\r\n");
            Ok(5)
        } else {
            Ok(0)
        }
    }

    fn generate_goaway(&mut self, _buf: &mut BinaryMut) -> ProtResult<usize> {
        self.close_latched = true;
        Ok(0)
    }
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
