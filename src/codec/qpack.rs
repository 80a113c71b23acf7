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

use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use webparse::{Binary, BinaryMut, Buf, BufMut};

use super::varint::{decode_varint, encode_varint};
use crate::{Http3ErrorCode, ProtError, ProtResult};

/// 编解码器与QPACK编码/解码指令流共享同一份状态
pub type SharedQpack = Arc<RwLock<Qpack>>;

pub fn shared_qpack() -> SharedQpack {
    Arc::new(RwLock::new(Qpack::new()))
}

lazy_static! {
    /// 静态表子集, 下标与完整表保持一致
    static ref STATIC_TABLE: Vec<(&'static str, &'static str)> = vec![
        (":authority", ""),
        (":path", "/"),
        ("age", "0"),
        ("content-disposition", ""),
        ("content-length", "0"),
        ("cookie", ""),
        ("date", ""),
        ("etag", ""),
        ("if-modified-since", ""),
        ("if-none-match", ""),
        ("last-modified", ""),
        ("link", ""),
        ("location", ""),
        ("referer", ""),
        ("set-cookie", ""),
        (":method", "CONNECT"),
        (":method", "DELETE"),
        (":method", "GET"),
        (":method", "HEAD"),
        (":method", "OPTIONS"),
        (":method", "POST"),
        (":method", "PUT"),
        (":scheme", "http"),
        (":scheme", "https"),
        (":status", "103"),
        (":status", "200"),
        (":status", "304"),
        (":status", "404"),
        (":status", "503"),
        ("accept", "*/*"),
        ("accept", "application/dns-message"),
        ("accept-encoding", "gzip, deflate, br"),
    ];
}

// 字段行与流上指令的标记
const LINE_INDEXED_STATIC: u8 = 0x01;
const LINE_INDEXED_DYNAMIC: u8 = 0x02;
const LINE_LITERAL: u8 = 0x03;

const INST_INSERT: u8 = 0x01;
const INST_INSERT_COUNT_INCREMENT: u8 = 0x01;
const INST_STREAM_CANCEL: u8 = 0x02;

/// 动态表条目超过该长度的不进表
const MAX_INDEXABLE_ENTRY: usize = 512;

/// QPACK状态, 编码側与解码侧各自独立.
/// 编码产生的插入指令堆积在编码指令流缓冲, 由会话在写循环前取走;
/// 解码产生的确认堆积在解码指令流缓冲, 同样由会话取走
pub struct Qpack {
    // 编码侧
    enc_table: Vec<(String, String)>,
    enc_insert_count: u64,
    enc_stream_out: BinaryMut,
    known_received_count: u64,
    max_table_capacity: u32,
    blocked_streams_allowed: u32,

    // 解码侧
    dec_table: Vec<(String, String)>,
    dec_insert_count: u64,
    dec_acked_count: u64,
    dec_stream_out: BinaryMut,
    dec_pending: BinaryMut,
}

impl Qpack {
    pub fn new() -> Self {
        use crate::Consts;
        Qpack {
            enc_table: Vec::new(),
            enc_insert_count: 0,
            enc_stream_out: BinaryMut::new(),
            known_received_count: 0,
            max_table_capacity: Consts::DEFAULT_HEADER_TABLE_SIZE,
            blocked_streams_allowed: Consts::DEFAULT_QPACK_BLOCKED_STREAMS,
            dec_table: Vec::new(),
            dec_insert_count: 0,
            dec_acked_count: 0,
            dec_stream_out: BinaryMut::new(),
            dec_pending: BinaryMut::new(),
        }
    }

    /// 编码侧已写入动态表的条目数, 也作为统计暴露
    pub fn insert_count(&self) -> u64 {
        self.enc_insert_count
    }

    pub fn decoder_insert_count(&self) -> u64 {
        self.dec_insert_count
    }

    pub fn known_received_count(&self) -> u64 {
        self.known_received_count
    }

    pub fn set_encoder_table_capacity(&mut self, capacity: u32) {
        self.max_table_capacity = capacity;
    }

    pub fn set_max_blocking(&mut self, blocked: u32) {
        self.blocked_streams_allowed = blocked;
    }

    fn indexable(&self, name: &str, value: &str) -> bool {
        self.max_table_capacity > 0
            && !name.starts_with(':')
            && !value.is_empty()
            && name.len() + value.len() <= MAX_INDEXABLE_ENTRY
    }

    /// 编码一段头部, 需要时向动态表插入并在编码指令流上产生插入指令.
    /// 输出格式: varint(所需插入数) varint(base) 后跟若干字段行
    pub fn encode_field_section(&mut self, fields: &[(String, String)]) -> Binary {
        let mut lines = BinaryMut::new();
        let mut required: u64 = 0;
        for (name, value) in fields {
            if let Some(idx) = STATIC_TABLE
                .iter()
                .position(|(n, v)| *n == name.as_str() && *v == value.as_str())
            {
                lines.put_slice(&[LINE_INDEXED_STATIC]);
                encode_varint(&mut lines, idx as u64);
                continue;
            }
            let dyn_idx = self.enc_table.iter().position(|(n, v)| n == name && v == value);
            let abs = match dyn_idx {
                Some(abs) => Some(abs as u64),
                None if self.indexable(name, value) => {
                    self.enc_table.push((name.clone(), value.clone()));
                    self.enc_insert_count += 1;
                    self.enc_stream_out.put_slice(&[INST_INSERT]);
                    encode_varint(&mut self.enc_stream_out, name.len() as u64);
                    self.enc_stream_out.put_slice(name.as_bytes());
                    encode_varint(&mut self.enc_stream_out, value.len() as u64);
                    self.enc_stream_out.put_slice(value.as_bytes());
                    Some(self.enc_insert_count - 1)
                }
                None => None,
            };
            match abs {
                Some(abs) => {
                    required = required.max(abs + 1);
                    lines.put_slice(&[LINE_INDEXED_DYNAMIC]);
                    encode_varint(&mut lines, abs);
                }
                None => {
                    lines.put_slice(&[LINE_LITERAL]);
                    encode_varint(&mut lines, name.len() as u64);
                    lines.put_slice(name.as_bytes());
                    encode_varint(&mut lines, value.len() as u64);
                    lines.put_slice(value.as_bytes());
                }
            }
        }
        let mut block = BinaryMut::new();
        encode_varint(&mut block, required);
        encode_varint(&mut block, required);
        block.put_slice(lines.chunk());
        block.freeze()
    }

    /// 解码一段头部. 所需插入数尚未在编码指令流上到达时返回None表示阻塞
    pub fn decode_field_section(
        &mut self,
        block: &[u8],
    ) -> ProtResult<Option<Vec<(String, String)>>> {
        let mut pos = 0usize;
        let (required, n) = decode_varint(block).ok_or_else(Self::decode_err)?;
        pos += n;
        let (_base, n) = decode_varint(&block[pos..]).ok_or_else(Self::decode_err)?;
        pos += n;

        if required > self.dec_insert_count {
            return Ok(None);
        }

        let mut fields = Vec::new();
        while pos < block.len() {
            let tag = block[pos];
            pos += 1;
            match tag {
                LINE_INDEXED_STATIC => {
                    let (idx, n) = decode_varint(&block[pos..]).ok_or_else(Self::decode_err)?;
                    pos += n;
                    let (name, value) = STATIC_TABLE
                        .get(idx as usize)
                        .ok_or_else(Self::decode_err)?;
                    fields.push((name.to_string(), value.to_string()));
                }
                LINE_INDEXED_DYNAMIC => {
                    let (abs, n) = decode_varint(&block[pos..]).ok_or_else(Self::decode_err)?;
                    pos += n;
                    let entry = self
                        .dec_table
                        .get(abs as usize)
                        .ok_or_else(Self::decode_err)?;
                    fields.push(entry.clone());
                }
                LINE_LITERAL => {
                    let (name, n) = Self::decode_string(&block[pos..])?;
                    pos += n;
                    let (value, n) = Self::decode_string(&block[pos..])?;
                    pos += n;
                    fields.push((name, value));
                }
                _ => return Err(Self::decode_err()),
            }
        }

        if required > self.dec_acked_count {
            let delta = required - self.dec_acked_count;
            self.dec_acked_count = required;
            self.dec_stream_out.put_slice(&[INST_INSERT_COUNT_INCREMENT]);
            encode_varint(&mut self.dec_stream_out, delta);
        }
        Ok(Some(fields))
    }

    /// 对端编码指令流到达, 全部消费, 半条指令留待下次
    pub fn on_encoder_instructions(&mut self, data: &[u8]) -> ProtResult<()> {
        self.dec_pending.put_slice(data);
        loop {
            let buf = self.dec_pending.chunk();
            if buf.is_empty() {
                return Ok(());
            }
            match buf[0] {
                INST_INSERT => {
                    let mut pos = 1usize;
                    let (name, n) = match Self::decode_string(&buf[pos..]) {
                        Ok(v) => v,
                        Err(_) => return Ok(()),
                    };
                    pos += n;
                    let (value, n) = match Self::decode_string(&buf[pos..]) {
                        Ok(v) => v,
                        Err(_) => return Ok(()),
                    };
                    pos += n;
                    self.dec_table.push((name, value));
                    self.dec_insert_count += 1;
                    self.dec_pending.advance(pos);
                }
                _ => return Err(Self::decode_err()),
            }
        }
    }

    /// 对端解码指令流到达, 插入数确认与流取消
    pub fn on_decoder_instructions(&mut self, data: &[u8]) -> ProtResult<()> {
        let mut pos = 0usize;
        while pos < data.len() {
            let tag = data[pos];
            pos += 1;
            match tag {
                INST_INSERT_COUNT_INCREMENT => {
                    let (delta, n) = decode_varint(&data[pos..]).ok_or_else(Self::decode_err)?;
                    pos += n;
                    self.known_received_count += delta;
                }
                INST_STREAM_CANCEL => {
                    let (_id, n) = decode_varint(&data[pos..]).ok_or_else(Self::decode_err)?;
                    pos += n;
                }
                _ => return Err(Self::decode_err()),
            }
        }
        Ok(())
    }

    /// 中止流时向对端宣告取消, 由解码指令流带出
    pub fn encode_cancel_stream(&mut self, stream_id: u64) {
        self.dec_stream_out.put_slice(&[INST_STREAM_CANCEL]);
        encode_varint(&mut self.dec_stream_out, stream_id);
    }

    pub fn take_encoder_stream_data(&mut self) -> Option<Binary> {
        if self.enc_stream_out.remaining() == 0 {
            return None;
        }
        let out = std::mem::replace(&mut self.enc_stream_out, BinaryMut::new());
        Some(out.freeze())
    }

    pub fn take_decoder_stream_data(&mut self) -> Option<Binary> {
        if self.dec_stream_out.remaining() == 0 {
            return None;
        }
        let out = std::mem::replace(&mut self.dec_stream_out, BinaryMut::new());
        Some(out.freeze())
    }

    fn decode_string(data: &[u8]) -> ProtResult<(String, usize)> {
        let (len, n) = decode_varint(data).ok_or_else(Self::decode_err)?;
        let len = len as usize;
        if data.len() < n + len {
            return Err(Self::decode_err());
        }
        let s = String::from_utf8(data[n..n + len].to_vec()).map_err(|_| Self::decode_err())?;
        Ok((s, n + len))
    }

    fn decode_err() -> ProtError {
        ProtError::connection(
            Http3ErrorCode::QpackDecompressionFailed,
            "qpack decompression failed",
        )
    }
}
