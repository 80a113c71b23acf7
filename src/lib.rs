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

pub mod codec;
mod consts;
mod error;
pub mod quic;
mod session;

pub use codec::{HqSettings, Message, RecvRequest, RecvResponse};
pub use consts::Consts;
pub use error::{ErrorKind, Http3ErrorCode, ProtError, ProtResult};
pub use quic::{QuicEvent, QuicSocket, StreamId};
pub use session::{
    Builder, Control, Direction, DrainState, HqConnection, HqVersion, SessionController,
    StreamHandler, StreamKey, Txn, UniStreamType,
};
