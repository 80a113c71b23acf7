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

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::Consts;

/// 单向流的类别, 由流前导的变长整数经当前变体解释而来
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UniStreamType {
    Control,
    QpackEncoder,
    QpackDecoder,
    Push,
}

impl UniStreamType {
    pub fn preface_value(&self) -> u64 {
        match self {
            UniStreamType::Control => Consts::UNI_STREAM_CONTROL,
            UniStreamType::Push => Consts::UNI_STREAM_PUSH,
            UniStreamType::QpackEncoder => Consts::UNI_STREAM_QPACK_ENCODER,
            UniStreamType::QpackDecoder => Consts::UNI_STREAM_QPACK_DECODER,
        }
    }
}

/// 协议变体, ALPN协商后绑定且不再改变.
/// 三个变体共享同一个会话, 差异点全部经由这里穷尽分发
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HqVersion {
    /// 每条流上裸HTTP/1.1, 无控制流, 靠Connection: close排空
    H1qV1,
    /// HTTP/1.1加一条遗留控制流承载GOAWAY
    H1qV2,
    /// 真正的HTTP/3
    Hq,
}

lazy_static! {
    static ref ALPN_VERSIONS: HashMap<&'static str, HqVersion> = {
        let mut m = HashMap::new();
        m.insert(Consts::ALPN_H1Q_FB, HqVersion::H1qV1);
        m.insert(Consts::ALPN_H1Q_FB_V2, HqVersion::H1qV2);
        m.insert(Consts::ALPN_H3, HqVersion::Hq);
        m.insert(Consts::ALPN_H3_FB, HqVersion::Hq);
        m
    };
}

impl HqVersion {
    pub fn from_alpn(alpn: &str) -> Option<HqVersion> {
        ALPN_VERSIONS.get(alpn).copied()
    }

    pub fn uses_control_streams(&self) -> bool {
        !matches!(self, HqVersion::H1qV1)
    }

    pub fn uses_qpack(&self) -> bool {
        matches!(self, HqVersion::Hq)
    }

    pub fn sends_settings(&self) -> bool {
        matches!(self, HqVersion::Hq)
    }

    pub fn partial_reliability_capable(&self) -> bool {
        matches!(self, HqVersion::Hq)
    }

    /// 本端需要创建的出向控制流
    pub fn egress_control_streams(&self) -> &'static [UniStreamType] {
        match self {
            HqVersion::H1qV1 => &[],
            HqVersion::H1qV2 => &[UniStreamType::Control],
            HqVersion::Hq => &[
                UniStreamType::Control,
                UniStreamType::QpackEncoder,
                UniStreamType::QpackDecoder,
            ],
        }
    }

    /// 前导到流类型, 无法识别的交由调用方拒绝
    pub fn parse_stream_preface(&self, preface: u64) -> Option<UniStreamType> {
        match self {
            HqVersion::H1qV1 => None,
            HqVersion::H1qV2 => match preface {
                v if v == Consts::UNI_STREAM_CONTROL => Some(UniStreamType::Control),
                _ => None,
            },
            HqVersion::Hq => match preface {
                v if v == Consts::UNI_STREAM_CONTROL => Some(UniStreamType::Control),
                v if v == Consts::UNI_STREAM_PUSH => Some(UniStreamType::Push),
                v if v == Consts::UNI_STREAM_QPACK_ENCODER => Some(UniStreamType::QpackEncoder),
                v if v == Consts::UNI_STREAM_QPACK_DECODER => Some(UniStreamType::QpackDecoder),
                _ => None,
            },
        }
    }
}
