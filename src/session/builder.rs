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

use std::time::Duration;

use crate::codec::HqSettings;

/// 会话配置, 窗口尺寸必须在传输握手里宣告, 不走SETTINGS帧
#[derive(Debug, Clone)]
pub struct Builder {
    /// 单个事务的空闲超时, None则不设
    pub transactions_timeout: Option<Duration>,

    /// 新建流的接收窗口
    pub receive_stream_window: Option<u64>,

    /// 连接级接收窗口
    pub receive_session_window: Option<u64>,

    /// 发给对端的SETTINGS
    pub settings: HqSettings,

    /// 是否启用部分可靠传输(仅HQ变体生效)
    pub partial_reliability: bool,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            transactions_timeout: Some(Duration::from_secs(5)),
            receive_stream_window: None,
            receive_session_window: None,
            settings: HqSettings::default(),
            partial_reliability: false,
        }
    }

    pub fn transactions_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transactions_timeout = timeout;
        self
    }

    pub fn receive_stream_window(mut self, window: u64) -> Self {
        self.receive_stream_window = Some(window);
        self
    }

    pub fn receive_session_window(mut self, window: u64) -> Self {
        self.receive_session_window = Some(window);
        self
    }

    pub fn settings(mut self, settings: HqSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn partial_reliability(mut self, enabled: bool) -> Self {
        self.partial_reliability = enabled;
        self
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
