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

use std::{fmt::Display, io};

use webparse::WebError;

pub type ProtResult<T> = Result<T, ProtError>;

/// HTTP/3应用层错误码, 发送在RESET_STREAM/STOP_SENDING/CONNECTION_CLOSE上
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Http3ErrorCode {
    NoError,
    GeneralProtocolError,
    InternalError,
    WrongStream,
    ClosedCriticalStream,
    UnknownStreamType,
    WrongStreamCount,
    RequestRejected,
    RequestCancelled,
    MalformedFramePushPromise,
    QpackDecompressionFailed,
    /// 本地使用, 0-RTT与TCP竞速失败时将所有流报错重试
    GiveupZeroRtt,
    Unknown(u64),
}

impl Http3ErrorCode {
    pub fn as_u64(&self) -> u64 {
        match self {
            Http3ErrorCode::NoError => 0x100,
            Http3ErrorCode::GeneralProtocolError => 0x101,
            Http3ErrorCode::InternalError => 0x102,
            Http3ErrorCode::WrongStream => 0x103,
            Http3ErrorCode::ClosedCriticalStream => 0x104,
            Http3ErrorCode::UnknownStreamType => 0x106,
            Http3ErrorCode::WrongStreamCount => 0x107,
            Http3ErrorCode::RequestRejected => 0x10b,
            Http3ErrorCode::RequestCancelled => 0x10c,
            Http3ErrorCode::MalformedFramePushPromise => 0x10e,
            Http3ErrorCode::QpackDecompressionFailed => 0x200,
            Http3ErrorCode::GiveupZeroRtt => 0x1f2,
            Http3ErrorCode::Unknown(v) => *v,
        }
    }

    pub fn from_u64(value: u64) -> Http3ErrorCode {
        match value {
            0x100 => Http3ErrorCode::NoError,
            0x101 => Http3ErrorCode::GeneralProtocolError,
            0x102 => Http3ErrorCode::InternalError,
            0x103 => Http3ErrorCode::WrongStream,
            0x104 => Http3ErrorCode::ClosedCriticalStream,
            0x106 => Http3ErrorCode::UnknownStreamType,
            0x107 => Http3ErrorCode::WrongStreamCount,
            0x10b => Http3ErrorCode::RequestRejected,
            0x10c => Http3ErrorCode::RequestCancelled,
            0x10e => Http3ErrorCode::MalformedFramePushPromise,
            0x200 => Http3ErrorCode::QpackDecompressionFailed,
            0x1f2 => Http3ErrorCode::GiveupZeroRtt,
            v => Http3ErrorCode::Unknown(v),
        }
    }
}

impl Display for Http3ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}(0x{:x})", self, self.as_u64())
    }
}

/// 错误恢复类别, 上层根据此判断是否可重试或者需要关闭连接
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 流被对端中止, 其他流不受影响
    StreamAbort,
    /// 对端未处理该流, 可以安全地在新连接上重试
    StreamUnacknowledged,
    /// 0-RTT数据未被接受, 可重试
    EarlyDataFailed,
    Timeout,
    Write,
    Shutdown,
    ConnectionReset,
    Dropped,
    Connect,
    Connection,
}

#[derive(Debug)]
pub enum ProtError {
    /// 标准错误库的错误类型
    IoError(io::Error),
    /// 解析库发生错误
    WebError(WebError),
    /// 其它错误信息
    Extension(&'static str),
    /// 流级错误, 只影响单个流
    Stream {
        kind: ErrorKind,
        code: Http3ErrorCode,
        msg: String,
    },
    /// 连接级错误, 将在下一次循环关闭整个连接
    Connection {
        kind: ErrorKind,
        code: Http3ErrorCode,
        msg: String,
    },
}

impl ProtError {
    pub fn stream(kind: ErrorKind, code: Http3ErrorCode, msg: impl Into<String>) -> Self {
        ProtError::Stream {
            kind,
            code,
            msg: msg.into(),
        }
    }

    pub fn stream_abort(code: Http3ErrorCode, msg: impl Into<String>) -> Self {
        Self::stream(ErrorKind::StreamAbort, code, msg)
    }

    pub fn stream_unacked(code: Http3ErrorCode, msg: impl Into<String>) -> Self {
        Self::stream(ErrorKind::StreamUnacknowledged, code, msg)
    }

    pub fn stream_timeout(msg: impl Into<String>) -> Self {
        Self::stream(ErrorKind::Timeout, Http3ErrorCode::InternalError, msg)
    }

    pub fn connection(code: Http3ErrorCode, msg: impl Into<String>) -> Self {
        ProtError::Connection {
            kind: ErrorKind::Connection,
            code,
            msg: msg.into(),
        }
    }

    pub fn connection_kind(
        kind: ErrorKind,
        code: Http3ErrorCode,
        msg: impl Into<String>,
    ) -> Self {
        ProtError::Connection {
            kind,
            code,
            msg: msg.into(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ProtError::Stream { kind, .. } => Some(*kind),
            ProtError::Connection { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<Http3ErrorCode> {
        match self {
            ProtError::Stream { code, .. } => Some(*code),
            ProtError::Connection { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// 是否可安全地在新连接上重试该请求
    pub fn is_safe_to_retry(&self) -> bool {
        matches!(
            self.kind(),
            Some(ErrorKind::StreamUnacknowledged) | Some(ErrorKind::EarlyDataFailed)
        )
    }

    pub fn is_stream_level(&self) -> bool {
        matches!(self, ProtError::Stream { .. })
    }

    pub fn is_connection_level(&self) -> bool {
        matches!(self, ProtError::Connection { .. })
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == Some(ErrorKind::Timeout)
    }

    pub fn is_io(&self) -> bool {
        matches!(self, Self::IoError(_))
    }
}

impl Display for ProtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtError::IoError(_) => f.write_str("io error"),
            ProtError::WebError(w) => w.fmt(f),
            ProtError::Extension(s) => f.write_fmt(format_args!("extension {}", s)),
            ProtError::Stream { kind, code, msg } => {
                f.write_fmt(format_args!("stream error {:?} {} {}", kind, code, msg))
            }
            ProtError::Connection { kind, code, msg } => {
                f.write_fmt(format_args!("connection error {:?} {} {}", kind, code, msg))
            }
        }
    }
}

impl From<io::Error> for ProtError {
    fn from(value: io::Error) -> Self {
        ProtError::IoError(value)
    }
}

impl From<WebError> for ProtError {
    fn from(value: WebError) -> Self {
        ProtError::WebError(value)
    }
}
