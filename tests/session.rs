// #![deny(warnings)]
#![deny(rust_2018_idioms)]

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::future::poll_fn;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use std::time::Duration;

    use webparse::{Binary, BinaryMut, Buf, BufMut, Request, Response};

    use wmquic::codec::{decode_varint, encode_varint, Message, Qpack};
    use wmquic::quic::{
        FlowControlInfo, QuicErrorCode, QuicEvent, QuicSocket, StreamId, StreamTransportInfo,
        TransportInfo,
    };
    use wmquic::{
        Builder, Consts, DrainState, ErrorKind, HqConnection, Http3ErrorCode, ProtResult,
        SessionController, StreamHandler, StreamKey, Txn,
    };

    // ------------------------------------------------------------------
    // 模拟的QUIC套接字, 事件由测试主动塞入

    #[derive(Default)]
    struct MockStream {
        read_buf: Vec<u8>,
        read_eof: bool,
        paused: bool,
        written: Vec<u8>,
        fin: bool,
        write_offset: u64,
        send_window: u64,
        delivery: Vec<u64>,
        resets: Vec<u64>,
        stop_sendings: Vec<u64>,
        is_control: bool,
    }

    struct MockQuicSocket {
        events: VecDeque<QuicEvent>,
        streams: BTreeMap<StreamId, MockStream>,
        next_bidi: StreamId,
        next_uni: StreamId,
        alpn: String,
        good: bool,
        conn_budget: u64,
        write_ready_pending: bool,
        closed: Option<Option<(Http3ErrorCode, String)>>,
        expired_calls: Vec<(StreamId, u64)>,
        rejected_calls: Vec<(StreamId, u64)>,
        write_log: Vec<StreamId>,
        default_window: u64,
        pings: usize,
    }

    impl MockQuicSocket {
        fn new(alpn: &str, is_server: bool) -> Self {
            MockQuicSocket {
                events: VecDeque::new(),
                streams: BTreeMap::new(),
                next_bidi: if is_server { 1 } else { 0 },
                next_uni: if is_server { 3 } else { 2 },
                alpn: alpn.to_string(),
                good: true,
                conn_budget: 1 << 20,
                write_ready_pending: false,
                closed: None,
                expired_calls: Vec::new(),
                rejected_calls: Vec::new(),
                write_log: Vec::new(),
                default_window: 1 << 20,
                pings: 0,
            }
        }

        fn new_server(alpn: &str) -> Self {
            Self::new(alpn, true)
        }

        fn new_client(alpn: &str) -> Self {
            Self::new(alpn, false)
        }

        fn entry(&mut self, id: StreamId) -> &mut MockStream {
            let window = self.default_window;
            self.streams.entry(id).or_insert_with(|| MockStream {
                send_window: window,
                ..MockStream::default()
            })
        }

        fn transport_ready(&mut self) {
            self.events.push_back(QuicEvent::TransportReady);
        }

        fn peer_open_bidi(&mut self, id: StreamId) {
            self.entry(id);
            self.events.push_back(QuicEvent::NewBidirectionalStream(id));
        }

        fn peer_open_uni(&mut self, id: StreamId) {
            self.entry(id);
            self.events.push_back(QuicEvent::NewUnidirectionalStream(id));
        }

        fn deliver(&mut self, id: StreamId, data: &[u8], eof: bool) {
            let stream = self.entry(id);
            stream.read_buf.extend_from_slice(data);
            stream.read_eof |= eof;
            if !stream.paused {
                self.events.push_back(QuicEvent::ReadAvailable(id));
            }
        }

        fn deliver_reset(&mut self, id: StreamId, code: u64) {
            self.events
                .push_back(QuicEvent::ReadError(id, QuicErrorCode::Application(code)));
        }

        fn deliver_stop_sending(&mut self, id: StreamId, code: u64) {
            self.events.push_back(QuicEvent::StopSending(id, code));
        }

        fn set_window(&mut self, id: StreamId, window: u64) {
            self.entry(id).send_window = window;
        }

        fn open_window(&mut self, id: StreamId, window: u64) {
            self.entry(id).send_window = window;
            self.events.push_back(QuicEvent::FlowControlUpdate(id));
        }

        fn written(&self, id: StreamId) -> Vec<u8> {
            self.streams
                .get(&id)
                .map(|s| s.written.clone())
                .unwrap_or_default()
        }

        fn fin_written(&self, id: StreamId) -> bool {
            self.streams.get(&id).map(|s| s.fin).unwrap_or(false)
        }

        fn resets(&self, id: StreamId) -> Vec<u64> {
            self.streams
                .get(&id)
                .map(|s| s.resets.clone())
                .unwrap_or_default()
        }

        fn stop_sendings(&self, id: StreamId) -> Vec<u64> {
            self.streams
                .get(&id)
                .map(|s| s.stop_sendings.clone())
                .unwrap_or_default()
        }

        fn pending_deliveries(&self, id: StreamId) -> usize {
            self.streams.get(&id).map(|s| s.delivery.len()).unwrap_or(0)
        }

        /// 模拟对端确认最早注册的送达回调
        fn ack_next_delivery(&mut self, id: StreamId) -> bool {
            let stream = match self.streams.get_mut(&id) {
                Some(s) => s,
                None => return false,
            };
            if stream.delivery.is_empty() {
                return false;
            }
            let offset = stream.delivery.remove(0);
            self.events
                .push_back(QuicEvent::DeliveryAck {
                    stream_id: id,
                    offset,
                });
            true
        }
    }

    impl QuicSocket for MockQuicSocket {
        fn poll_event(&mut self, _cx: &mut Context<'_>) -> Poll<Option<QuicEvent>> {
            match self.events.pop_front() {
                Some(event) => {
                    if matches!(&event, QuicEvent::ConnectionWriteReady(_)) {
                        self.write_ready_pending = false;
                    }
                    Poll::Ready(Some(event))
                }
                None => Poll::Pending,
            }
        }

        fn good(&self) -> bool {
            self.good
        }

        fn app_protocol(&self) -> Option<String> {
            if self.alpn.is_empty() {
                None
            } else {
                Some(self.alpn.clone())
            }
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            Some("127.0.0.1:443".parse().unwrap())
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            Some("127.0.0.1:50000".parse().unwrap())
        }

        fn replay_safe(&self) -> bool {
            true
        }

        fn create_bidirectional_stream(&mut self) -> ProtResult<StreamId> {
            let id = self.next_bidi;
            self.next_bidi += 4;
            self.entry(id);
            Ok(id)
        }

        fn create_unidirectional_stream(&mut self) -> ProtResult<StreamId> {
            let id = self.next_uni;
            self.next_uni += 4;
            self.entry(id);
            Ok(id)
        }

        fn read(&mut self, id: StreamId, _max: usize) -> ProtResult<(Binary, bool)> {
            let stream = self.entry(id);
            let data = std::mem::take(&mut stream.read_buf);
            Ok((Binary::from(data), stream.read_eof))
        }

        fn peek(&mut self, id: StreamId) -> ProtResult<(Binary, bool)> {
            let stream = self.entry(id);
            Ok((Binary::from(stream.read_buf.clone()), stream.read_eof))
        }

        fn consume(&mut self, id: StreamId, amount: usize) -> ProtResult<()> {
            let stream = self.entry(id);
            stream.read_buf.drain(..amount.min(stream.read_buf.len()));
            Ok(())
        }

        fn pause_read(&mut self, id: StreamId) {
            self.entry(id).paused = true;
        }

        fn resume_read(&mut self, id: StreamId) {
            let stream = self.entry(id);
            stream.paused = false;
            if !stream.read_buf.is_empty() || stream.read_eof {
                self.events.push_back(QuicEvent::ReadAvailable(id));
            }
        }

        fn write_chain(
            &mut self,
            id: StreamId,
            data: Binary,
            fin: bool,
            want_delivery: bool,
        ) -> ProtResult<Option<Binary>> {
            self.write_log.push(id);
            let stream = self.entry(id);
            let len = data.remaining() as u64;
            let accept = stream.send_window.min(len) as usize;
            stream.written.extend_from_slice(&data.chunk()[..accept]);
            stream.write_offset += accept as u64;
            stream.send_window -= accept as u64;
            let rest = if (accept as u64) < len {
                Some(Binary::from(data.chunk()[accept..].to_vec()))
            } else {
                None
            };
            if rest.is_none() && fin {
                stream.fin = true;
                if want_delivery {
                    let offset = stream.write_offset;
                    stream.delivery.push(offset);
                }
            }
            Ok(rest)
        }

        fn register_delivery_callback(&mut self, id: StreamId, offset: u64) -> ProtResult<()> {
            self.entry(id).delivery.push(offset);
            Ok(())
        }

        fn reset_stream(&mut self, id: StreamId, code: Http3ErrorCode) -> ProtResult<()> {
            let stream = self.entry(id);
            stream.resets.push(code.as_u64());
            // 流被重置, 在途的送达回调全部取消
            let canceled: Vec<u64> = stream.delivery.drain(..).collect();
            for offset in canceled {
                self.events.push_back(QuicEvent::DeliveryCanceled {
                    stream_id: id,
                    offset,
                });
            }
            Ok(())
        }

        fn stop_sending(&mut self, id: StreamId, code: Http3ErrorCode) -> ProtResult<()> {
            self.entry(id).stop_sendings.push(code.as_u64());
            Ok(())
        }

        fn set_control_stream(&mut self, id: StreamId) -> ProtResult<()> {
            self.entry(id).is_control = true;
            Ok(())
        }

        fn stream_flow_control(&mut self, id: StreamId) -> ProtResult<FlowControlInfo> {
            match self.streams.get(&id) {
                Some(stream) => Ok(FlowControlInfo {
                    send_window_available: stream.send_window,
                    receive_window_available: 1 << 20,
                }),
                None => Err(wmquic::ProtError::Extension("stream not exists")),
            }
        }

        fn set_stream_flow_control_window(&mut self, _id: StreamId, _window: u64) {}

        fn set_connection_flow_control_window(&mut self, _window: u64) {}

        fn stream_write_offset(&self, id: StreamId) -> ProtResult<u64> {
            self.streams
                .get(&id)
                .map(|s| s.write_offset)
                .ok_or(wmquic::ProtError::Extension("stream not exists"))
        }

        fn stream_write_buffered(&self, _id: StreamId) -> ProtResult<u64> {
            Ok(0)
        }

        fn send_data_expired(&mut self, id: StreamId, offset: u64) -> ProtResult<u64> {
            self.expired_calls.push((id, offset));
            Ok(offset)
        }

        fn send_data_rejected(&mut self, id: StreamId, offset: u64) -> ProtResult<u64> {
            self.rejected_calls.push((id, offset));
            Ok(offset)
        }

        fn send_ping(&mut self) {
            self.pings += 1;
        }

        fn transport_info(&self) -> TransportInfo {
            TransportInfo::default()
        }

        fn stream_transport_info(&self, _id: StreamId) -> ProtResult<StreamTransportInfo> {
            Ok(StreamTransportInfo::default())
        }

        fn close(&mut self, err: Option<(Http3ErrorCode, String)>) {
            self.good = false;
            self.closed = Some(err);
        }

        fn notify_pending_write(&mut self) {
            if !self.write_ready_pending && self.good {
                self.write_ready_pending = true;
                self.events
                    .push_back(QuicEvent::ConnectionWriteReady(self.conn_budget));
            }
        }
    }

    // ------------------------------------------------------------------
    // 测试处理器与控制器

    #[derive(Default)]
    struct TxnEvents {
        headers: Vec<String>,
        body: Vec<u8>,
        eom: usize,
        errors: Vec<(Option<ErrorKind>, String)>,
        retryable_errors: usize,
        detached: usize,
        goaway: usize,
        timeouts: usize,
        header_acked: usize,
        last_byte_acked: usize,
        first_header_flushed: usize,
        last_byte_flushed: usize,
        body_skipped: Vec<u64>,
        body_rejected: Vec<u64>,
        push_promises: Vec<u64>,
        push_stream_id: Option<StreamId>,
    }

    type SharedEvents = Arc<Mutex<TxnEvents>>;

    fn new_events() -> SharedEvents {
        Arc::new(Mutex::new(TxnEvents::default()))
    }

    struct TestHandler {
        ev: SharedEvents,
        /// 收到EOM时回应的(状态码, 包体长度)
        respond: Option<(u16, usize)>,
        /// 接受推送承诺时给推送事务记录事件的地方
        accept_push: Option<SharedEvents>,
        /// EOM时在本事务上发起推送
        push_on_eom: Option<SharedEvents>,
    }

    impl TestHandler {
        fn new(ev: SharedEvents) -> Self {
            TestHandler {
                ev,
                respond: None,
                accept_push: None,
                push_on_eom: None,
            }
        }

        fn respond(ev: SharedEvents, status: u16, body_len: usize) -> Self {
            TestHandler {
                ev,
                respond: Some((status, body_len)),
                accept_push: None,
                push_on_eom: None,
            }
        }

        fn send_response(txn: &mut Txn<'_>, status: u16, body_len: usize) {
            let res = Response::builder()
                .status(status)
                .header("content-length", format!("{}", body_len))
                .body(Binary::new())
                .unwrap();
            txn.send_headers(Message::Response(res), false).unwrap();
            if body_len > 0 {
                txn.send_body(Binary::from(vec![b'x'; body_len]), false)
                    .unwrap();
            }
            txn.send_eom().unwrap();
        }
    }

    impl StreamHandler for TestHandler {
        fn on_headers(&mut self, _txn: &mut Txn<'_>, msg: Message) {
            let summary = match &msg {
                Message::Request(r) => format!("{} {}", r.method().as_str(), r.path()),
                Message::Response(r) => format!("{}", r.status().as_u16()),
            };
            self.ev.lock().unwrap().headers.push(summary);
        }

        fn on_body(&mut self, _txn: &mut Txn<'_>, data: Binary) {
            self.ev.lock().unwrap().body.extend_from_slice(data.chunk());
        }

        fn on_eom(&mut self, txn: &mut Txn<'_>) {
            self.ev.lock().unwrap().eom += 1;
            if let Some(push_ev) = self.push_on_eom.take() {
                let promise = Request::builder()
                    .method("GET")
                    .url("https://example.com/style.css")
                    .body(Binary::new())
                    .unwrap();
                let push_id = txn
                    .new_pushed_transaction(
                        Message::Request(promise),
                        Box::new(TestHandler::new(push_ev.clone())),
                    )
                    .unwrap();
                self.ev.lock().unwrap().push_stream_id = Some(push_id);
            }
            if let Some((status, body_len)) = self.respond {
                Self::send_response(txn, status, body_len);
            }
        }

        fn on_push_promise(
            &mut self,
            _txn: &mut Txn<'_>,
            push_id: u64,
            _msg: &Message,
        ) -> Option<Box<dyn StreamHandler>> {
            self.ev.lock().unwrap().push_promises.push(push_id);
            self.accept_push
                .take()
                .map(|ev| Box::new(TestHandler::new(ev)) as Box<dyn StreamHandler>)
        }

        fn on_error(&mut self, err: &wmquic::ProtError) {
            let mut ev = self.ev.lock().unwrap();
            if err.is_safe_to_retry() {
                ev.retryable_errors += 1;
            }
            ev.errors.push((err.kind(), format!("{}", err)));
        }

        fn on_timeout(&mut self, txn: &mut Txn<'_>) {
            self.ev.lock().unwrap().timeouts += 1;
            Self::send_response(txn, 408, 0);
        }

        fn on_goaway(&mut self) {
            self.ev.lock().unwrap().goaway += 1;
        }

        fn on_detach(&mut self) {
            self.ev.lock().unwrap().detached += 1;
        }

        fn on_body_skipped(&mut self, offset: u64) {
            self.ev.lock().unwrap().body_skipped.push(offset);
        }

        fn on_body_rejected(&mut self, offset: u64) {
            self.ev.lock().unwrap().body_rejected.push(offset);
        }

        fn on_first_header_byte_flushed(&mut self) {
            self.ev.lock().unwrap().first_header_flushed += 1;
        }

        fn on_last_byte_flushed(&mut self) {
            self.ev.lock().unwrap().last_byte_flushed += 1;
        }

        fn on_last_byte_acked(&mut self) {
            self.ev.lock().unwrap().last_byte_acked += 1;
        }

        fn on_last_egress_header_byte_acked(&mut self) {
            self.ev.lock().unwrap().header_acked += 1;
        }
    }

    struct TestController {
        requests: Arc<Mutex<Vec<SharedEvents>>>,
        respond: Option<(u16, usize)>,
        accept: bool,
        push_on_eom: Arc<Mutex<Option<SharedEvents>>>,
        timeout_handlers: Arc<Mutex<usize>>,
        destroyed: Arc<Mutex<bool>>,
    }

    impl TestController {
        fn new(respond: Option<(u16, usize)>) -> Self {
            TestController {
                requests: Arc::new(Mutex::new(Vec::new())),
                respond,
                accept: true,
                push_on_eom: Arc::new(Mutex::new(None)),
                timeout_handlers: Arc::new(Mutex::new(0)),
                destroyed: Arc::new(Mutex::new(false)),
            }
        }
    }

    impl SessionController for TestController {
        fn on_request(
            &mut self,
            _txn: &mut Txn<'_>,
            _msg: &Message,
        ) -> Option<Box<dyn StreamHandler>> {
            if !self.accept {
                return None;
            }
            let ev = new_events();
            self.requests.lock().unwrap().push(ev.clone());
            Some(Box::new(TestHandler {
                ev,
                respond: self.respond,
                accept_push: None,
                push_on_eom: self.push_on_eom.lock().unwrap().take(),
            }))
        }

        fn timeout_handler(&mut self) -> Box<dyn StreamHandler> {
            *self.timeout_handlers.lock().unwrap() += 1;
            Box::new(TestHandler::new(new_events()))
        }

        fn on_destroy(&mut self) {
            *self.destroyed.lock().unwrap() = true;
        }
    }

    // ------------------------------------------------------------------
    // 编码辅助: 对端视角的QPACK与HTTP/3帧

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn frame(frame_type: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = BinaryMut::new();
        encode_varint(&mut buf, frame_type);
        encode_varint(&mut buf, payload.len() as u64);
        buf.put_slice(payload);
        buf.chunk().to_vec()
    }

    fn headers_frame(q: &mut Qpack, pairs: &[(&str, &str)]) -> Vec<u8> {
        let block = q.encode_field_section(&fields(pairs));
        frame(Consts::FRAME_HEADERS, block.chunk())
    }

    fn data_frame(payload: &[u8]) -> Vec<u8> {
        frame(Consts::FRAME_DATA, payload)
    }

    fn push_promise_frame(q: &mut Qpack, push_id: u64, pairs: &[(&str, &str)]) -> Vec<u8> {
        let block = q.encode_field_section(&fields(pairs));
        let mut payload = BinaryMut::new();
        encode_varint(&mut payload, push_id);
        payload.put_slice(block.chunk());
        frame(Consts::FRAME_PUSH_PROMISE, payload.chunk())
    }

    fn goaway_frame(max_stream_id: u64) -> Vec<u8> {
        let mut payload = BinaryMut::new();
        encode_varint(&mut payload, max_stream_id);
        frame(Consts::FRAME_GOAWAY, payload.chunk())
    }

    fn uni_preface(stream_type: u64) -> Vec<u8> {
        let mut buf = BinaryMut::new();
        encode_varint(&mut buf, stream_type);
        buf.chunk().to_vec()
    }

    fn push_stream_preface(push_id: u64) -> Vec<u8> {
        let mut buf = BinaryMut::new();
        encode_varint(&mut buf, Consts::UNI_STREAM_PUSH);
        encode_varint(&mut buf, push_id);
        buf.chunk().to_vec()
    }

    fn get_request(q: &mut Qpack, path: &str) -> Vec<u8> {
        headers_frame(
            q,
            &[
                (":method", "GET"),
                (":path", path),
                (":scheme", "https"),
                (":authority", "example.com"),
            ],
        )
    }

    /// 跳过单向流前导后解析(类型, 载荷)序列
    fn parse_frames(data: &[u8], skip_preface: bool) -> Vec<(u64, Vec<u8>)> {
        let mut pos = 0usize;
        if skip_preface {
            let (_, n) = decode_varint(data).unwrap();
            pos += n;
        }
        let mut frames = Vec::new();
        while pos < data.len() {
            let (frame_type, n) = decode_varint(&data[pos..]).unwrap();
            pos += n;
            let (len, n) = decode_varint(&data[pos..]).unwrap();
            pos += n;
            frames.push((frame_type, data[pos..pos + len as usize].to_vec()));
            pos += len as usize;
        }
        frames
    }

    fn goaways_on_control(sock_written: &[u8]) -> Vec<u64> {
        parse_frames(sock_written, true)
            .into_iter()
            .filter(|(t, _)| *t == Consts::FRAME_GOAWAY)
            .map(|(_, payload)| decode_varint(&payload).unwrap().0)
            .collect()
    }

    async fn drive(conn: &mut HqConnection<MockQuicSocket>) {
        poll_fn(|cx| {
            let _ = conn.poll_handle(cx);
            Poll::Ready(())
        })
        .await;
    }

    struct ServerSetup {
        conn: HqConnection<MockQuicSocket>,
        requests: Arc<Mutex<Vec<SharedEvents>>>,
        timeout_handlers: Arc<Mutex<usize>>,
        destroyed: Arc<Mutex<bool>>,
        push_on_eom: Arc<Mutex<Option<SharedEvents>>>,
    }

    async fn setup_server(alpn: &str, builder: Builder, respond: Option<(u16, usize)>) -> ServerSetup {
        let _ = env_logger::builder().is_test(true).try_init();
        let controller = TestController::new(respond);
        let requests = controller.requests.clone();
        let timeout_handlers = controller.timeout_handlers.clone();
        let destroyed = controller.destroyed.clone();
        let push_on_eom = controller.push_on_eom.clone();
        let sock = MockQuicSocket::new_server(alpn);
        let mut conn = HqConnection::server(sock, builder, Box::new(controller));
        conn.start_now();
        conn.socket_mut().transport_ready();
        drive(&mut conn).await;
        ServerSetup {
            conn,
            requests,
            timeout_handlers,
            destroyed,
            push_on_eom,
        }
    }

    async fn setup_client(alpn: &str, builder: Builder) -> HqConnection<MockQuicSocket> {
        let _ = env_logger::builder().is_test(true).try_init();
        let controller = TestController::new(None);
        let sock = MockQuicSocket::new_client(alpn);
        let mut conn = HqConnection::client(sock, builder, Box::new(controller));
        conn.start_now();
        conn.socket_mut().transport_ready();
        drive(&mut conn).await;
        conn
    }

    // 服务端本地创建的控制流编号
    const SRV_CTRL: StreamId = 3;
    const SRV_QPACK_DEC: StreamId = 11;
    // 客户端本地创建的控制流编号
    const CLI_CTRL: StreamId = 2;

    // ------------------------------------------------------------------
    // 端到端场景

    #[tokio::test(start_paused = true)]
    async fn test_simple_get() {
        let mut s = setup_server("h3", Builder::new(), Some((200, 100))).await;

        // SETTINGS必须先于任何请求流字节出门
        assert_eq!(s.conn.socket().write_log.first(), Some(&SRV_CTRL));
        let ctrl_frames = parse_frames(&s.conn.socket().written(SRV_CTRL), true);
        assert!(ctrl_frames.iter().any(|(t, _)| *t == Consts::FRAME_SETTINGS));

        let mut q = Qpack::new();
        s.conn.socket_mut().peer_open_bidi(0);
        let req = get_request(&mut q, "/");
        s.conn.socket_mut().deliver(0, &req, true);
        drive(&mut s.conn).await;

        let requests = s.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        {
            let ev = requests[0].lock().unwrap();
            assert_eq!(ev.headers, vec!["GET /".to_string()]);
            // EOM只触发一次
            assert_eq!(ev.eom, 1);
            assert_eq!(ev.first_header_flushed, 1);
            assert_eq!(ev.last_byte_flushed, 1);
        }

        // 100字节包体加头部, 写偏移至少110, FIN已经写出
        let offset = s
            .conn
            .control()
            .stream_write_offset_of(StreamKey::Stream(0))
            .unwrap();
        assert!(offset >= 110, "offset = {}", offset);
        assert!(s.conn.socket().fin_written(0));

        // 响应头的content-length进了动态表
        let qpack = s.conn.control().qpack().unwrap();
        assert!(qpack.read().unwrap().insert_count() > 0);

        // 头部送达与FIN送达都确认后, 事务才脱离
        assert!(s.conn.socket_mut().ack_next_delivery(0));
        drive(&mut s.conn).await;
        assert!(s.conn.socket_mut().ack_next_delivery(0));
        drive(&mut s.conn).await;
        {
            let ev = requests[0].lock().unwrap();
            assert_eq!(ev.header_acked, 1);
            assert_eq!(ev.last_byte_acked, 1);
            assert_eq!(ev.detached, 1);
        }
        assert_eq!(s.conn.number_of_streams(), 0);
        assert_eq!(s.conn.socket().pending_deliveries(0), 0);
        assert!(!s.conn.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_goaway_on_close_when_idle() {
        let mut s = setup_server("h3", Builder::new(), None).await;

        // 三个未完成的请求
        for id in [8u64, 16, 24] {
            let mut q = Qpack::new();
            s.conn.socket_mut().peer_open_bidi(id);
            let req = get_request(&mut q, "/pending");
            s.conn.socket_mut().deliver(id, &req, false);
        }
        drive(&mut s.conn).await;
        assert_eq!(s.conn.number_of_streams(), 3);

        s.conn.close_when_idle();
        drive(&mut s.conn).await;
        let goaways = goaways_on_control(&s.conn.socket().written(SRV_CTRL));
        assert_eq!(goaways, vec![Consts::EIGHT_BYTE_LIMIT]);
        assert_eq!(s.conn.drain_state(), DrainState::FirstGoaway);

        // 第一个GOAWAY送达确认后, 第二个宣告真实的最大流编号
        assert!(s.conn.socket_mut().ack_next_delivery(SRV_CTRL));
        drive(&mut s.conn).await;
        let goaways = goaways_on_control(&s.conn.socket().written(SRV_CTRL));
        assert_eq!(goaways, vec![Consts::EIGHT_BYTE_LIMIT, 24]);
        assert_eq!(s.conn.drain_state(), DrainState::SecondGoaway);

        // 上限之外的新流被拒绝, 之内的照常接收
        s.conn.socket_mut().peer_open_bidi(28);
        drive(&mut s.conn).await;
        assert!(s
            .conn
            .socket()
            .stop_sendings(28)
            .contains(&Http3ErrorCode::RequestRejected.as_u64()));
        assert_eq!(s.conn.number_of_streams(), 3);

        let mut q = Qpack::new();
        s.conn.socket_mut().peer_open_bidi(20);
        let req = get_request(&mut q, "/late");
        s.conn.socket_mut().deliver(20, &req, false);
        drive(&mut s.conn).await;
        assert_eq!(s.conn.number_of_streams(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_qpack_blocked_headers() {
        let mut s = setup_server("h3", Builder::new(), Some((200, 100))).await;

        let mut q = Qpack::new();
        let req = headers_frame(
            &mut q,
            &[
                (":method", "GET"),
                (":path", "/"),
                (":scheme", "https"),
                (":authority", "example.com"),
                ("x-custom", "abc"),
            ],
        );
        let encoder_bytes = q.take_encoder_stream_data().expect("must have inserts");

        s.conn.socket_mut().peer_open_bidi(0);
        s.conn.socket_mut().deliver(0, &req, true);
        drive(&mut s.conn).await;
        // 引用的动态表项还没到, 处理器不能被调用
        assert_eq!(s.requests.lock().unwrap().len(), 0);
        assert_eq!(s.conn.number_of_streams(), 1);

        // 编码指令流到达后解除阻塞
        let mut uni = uni_preface(Consts::UNI_STREAM_QPACK_ENCODER);
        uni.extend_from_slice(encoder_bytes.chunk());
        s.conn.socket_mut().peer_open_uni(2);
        s.conn.socket_mut().deliver(2, &uni, false);
        drive(&mut s.conn).await;

        let requests = s.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        let ev = requests[0].lock().unwrap();
        assert_eq!(ev.headers, vec!["GET /".to_string()]);
        assert_eq!(ev.eom, 1);
        assert!(s.conn.socket().fin_written(0));
        // 解码侧的插入数确认走解码指令流
        assert!(s.conn.socket().written(SRV_QPACK_DEC).len() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_sending_mid_response() {
        let mut s = setup_server("h3", Builder::new(), Some((200, 100))).await;

        let mut q = Qpack::new();
        s.conn.socket_mut().peer_open_bidi(0);
        let req = get_request(&mut q, "/");
        s.conn.socket_mut().deliver(0, &req, true);
        let mut q2 = Qpack::new();
        s.conn.socket_mut().peer_open_bidi(4);
        let req2 = get_request(&mut q2, "/other");
        s.conn.socket_mut().deliver(4, &req2, false);
        drive(&mut s.conn).await;

        s.conn
            .socket_mut()
            .deliver_stop_sending(0, Http3ErrorCode::RequestCancelled.as_u64());
        drive(&mut s.conn).await;

        let requests = s.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        {
            let ev = requests[0].lock().unwrap();
            assert_eq!(ev.errors.len(), 1);
            assert_eq!(ev.errors[0].0, Some(ErrorKind::StreamAbort));
            assert_eq!(ev.detached, 1);
        }
        // 同级事务不受影响
        {
            let ev = requests[1].lock().unwrap();
            assert!(ev.errors.is_empty());
            assert_eq!(ev.detached, 0);
        }
        assert_eq!(s.conn.number_of_streams(), 1);
        assert!(s
            .conn
            .socket()
            .resets(0)
            .contains(&Http3ErrorCode::RequestCancelled.as_u64()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_control_staged_egress() {
        let mut s = setup_server("h3", Builder::new(), Some((200, 100))).await;

        let mut q = Qpack::new();
        s.conn.socket_mut().peer_open_bidi(0);
        s.conn.socket_mut().set_window(0, 10);
        let req = get_request(&mut q, "/");
        s.conn.socket_mut().deliver(0, &req, true);
        drive(&mut s.conn).await;

        // 窗口只有10字节, 写循环停在那里
        assert_eq!(s.conn.socket().written(0).len(), 10);
        assert!(!s.conn.socket().fin_written(0));

        // 窗口打开后剩余部分连同FIN一起出门
        let total = s
            .conn
            .control()
            .stream_write_offset_of(StreamKey::Stream(0))
            .unwrap();
        s.conn.socket_mut().open_window(0, 200);
        drive(&mut s.conn).await;
        assert_eq!(s.conn.socket().written(0).len() as u64, total);
        assert!(s.conn.socket().fin_written(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_reliability_skip() {
        let builder = Builder::new().partial_reliability(true);
        let mut s = setup_server("h3", builder, None).await;

        let mut q = Qpack::new();
        s.conn.socket_mut().peer_open_bidi(0);
        let req = get_request(&mut q, "/video");
        s.conn.socket_mut().deliver(0, &req, true);
        drive(&mut s.conn).await;

        // 先把头部和前50字节送出去
        {
            let mut txn = s.conn.transaction(StreamKey::Stream(0)).unwrap();
            let res = Response::builder()
                .status(200)
                .header("content-length", "100")
                .body(Binary::new())
                .unwrap();
            txn.send_headers(Message::Response(res), false).unwrap();
            txn.send_body(Binary::from(vec![b'a'; 50]), false).unwrap();
        }
        drive(&mut s.conn).await;
        let flushed = s.conn.socket().written(0).len();
        assert!(flushed > 50);

        // 后50字节堵在本地缓冲里, 然后宣告跳过
        s.conn.socket_mut().set_window(0, 0);
        let wire_offset = {
            let mut txn = s.conn.transaction(StreamKey::Stream(0)).unwrap();
            txn.send_body(Binary::from(vec![b'b'; 50]), false).unwrap();
            txn.skip_body_to(100).unwrap()
        };
        assert_eq!(s.conn.socket().expired_calls, vec![(0, wire_offset)]);

        {
            let mut txn = s.conn.transaction(StreamKey::Stream(0)).unwrap();
            txn.send_eom().unwrap();
        }
        s.conn.socket_mut().open_window(0, 1 << 20);
        drive(&mut s.conn).await;
        // 被跳过的包体没有写到线上
        assert_eq!(s.conn.socket().written(0).len(), flushed);
        assert!(s.conn.socket().fin_written(0));
    }

    // ------------------------------------------------------------------
    // 边界行为

    #[tokio::test(start_paused = true)]
    async fn test_unknown_uni_stream_preface() {
        let mut s = setup_server("h3", Builder::new(), None).await;
        s.conn.socket_mut().peer_open_uni(2);
        s.conn.socket_mut().deliver(2, &uni_preface(0x42), false);
        drive(&mut s.conn).await;
        assert!(s
            .conn
            .socket()
            .stop_sendings(2)
            .contains(&Http3ErrorCode::UnknownStreamType.as_u64()));
        assert_eq!(s.conn.number_of_streams(), 0);
        assert!(!s.conn.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_control_stream_is_fatal() {
        let mut s = setup_server("h3", Builder::new(), None).await;
        s.conn.socket_mut().peer_open_uni(2);
        s.conn
            .socket_mut()
            .deliver(2, &uni_preface(Consts::UNI_STREAM_CONTROL), false);
        drive(&mut s.conn).await;
        assert!(!s.conn.is_destroyed());

        s.conn.socket_mut().peer_open_uni(6);
        s.conn
            .socket_mut()
            .deliver(6, &uni_preface(Consts::UNI_STREAM_CONTROL), false);
        drive(&mut s.conn).await;
        assert!(s.conn.is_destroyed());
        assert!(s.conn.socket().closed.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transaction_timeout_without_handler() {
        let mut s = setup_server("h3", Builder::new(), None).await;

        // 头部残缺, 没法派处理器
        s.conn.socket_mut().peer_open_bidi(0);
        s.conn.socket_mut().deliver(0, &[0x01, 0x30], false);
        drive(&mut s.conn).await;
        assert_eq!(s.requests.lock().unwrap().len(), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        drive(&mut s.conn).await;

        // 控制器给的兜底处理器生成了错误响应
        assert_eq!(*s.timeout_handlers.lock().unwrap(), 1);
        assert!(s
            .conn
            .socket()
            .stop_sendings(0)
            .contains(&Http3ErrorCode::InternalError.as_u64()));
        assert!(!s.conn.socket().written(0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_when_idle_is_idempotent() {
        let mut s = setup_server("h3", Builder::new(), None).await;
        s.conn.close_when_idle();
        s.conn.close_when_idle();
        drive(&mut s.conn).await;
        assert_eq!(
            goaways_on_control(&s.conn.socket().written(SRV_CTRL)).len(),
            1
        );

        assert!(s.conn.socket_mut().ack_next_delivery(SRV_CTRL));
        drive(&mut s.conn).await;
        assert!(s.conn.socket_mut().ack_next_delivery(SRV_CTRL));
        drive(&mut s.conn).await;

        assert_eq!(s.conn.drain_state(), DrainState::Done);
        assert!(s.conn.is_destroyed());
        assert!(*s.destroyed.lock().unwrap());
        assert_eq!(
            goaways_on_control(&s.conn.socket().written(SRV_CTRL)).len(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_connection_terminal_notifications() {
        let mut s = setup_server("h3", Builder::new(), None).await;
        for id in [0u64, 4] {
            let mut q = Qpack::new();
            s.conn.socket_mut().peer_open_bidi(id);
            let req = get_request(&mut q, "/open");
            s.conn.socket_mut().deliver(id, &req, false);
        }
        drive(&mut s.conn).await;
        let requests = s.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);

        s.conn.drop_connection();
        for ev in &requests {
            let ev = ev.lock().unwrap();
            assert_eq!(ev.errors.len(), 1);
            assert_eq!(ev.errors[0].0, Some(ErrorKind::Dropped));
            assert_eq!(ev.detached, 1);
        }
        assert!(s.conn.is_destroyed());
        assert_eq!(s.conn.number_of_streams(), 0);
        let closed = s.conn.socket().closed.clone().flatten();
        assert_eq!(closed.map(|(code, _)| code), Some(Http3ErrorCode::NoError));

        // 拆掉之后不会再有任何回调
        s.conn.socket_mut().deliver(0, b"junk", false);
        drive(&mut s.conn).await;
        for ev in &requests {
            let ev = ev.lock().unwrap();
            assert_eq!(ev.errors.len(), 1);
            assert_eq!(ev.detached, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_reply_policy_downstream() {
        let mut s = setup_server("h3", Builder::new(), None).await;
        let mut q = Qpack::new();
        s.conn.socket_mut().peer_open_bidi(0);
        let req = get_request(&mut q, "/");
        s.conn.socket_mut().deliver(0, &req, false);
        drive(&mut s.conn).await;

        // 入向已经消费过, 回应用NO_ERROR
        s.conn
            .socket_mut()
            .deliver_reset(0, Http3ErrorCode::RequestCancelled.as_u64());
        drive(&mut s.conn).await;
        assert!(s
            .conn
            .socket()
            .resets(0)
            .contains(&Http3ErrorCode::NoError.as_u64()));
        let requests = s.requests.lock().unwrap().clone();
        let ev = requests[0].lock().unwrap();
        assert_eq!(ev.errors[0].0, Some(ErrorKind::StreamAbort));
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_after_eom_aborts_only_that_transaction() {
        let mut s = setup_server("h3", Builder::new(), Some((200, 10))).await;
        let mut q = Qpack::new();
        s.conn.socket_mut().peer_open_bidi(0);
        let req = get_request(&mut q, "/");
        s.conn.socket_mut().deliver(0, &req, true);
        drive(&mut s.conn).await;

        // 编解码器已经看到EOM, 再来的字节只拆这个事务
        s.conn.socket_mut().deliver(0, b"trailing-junk", false);
        drive(&mut s.conn).await;
        let requests = s.requests.lock().unwrap().clone();
        assert_eq!(requests[0].lock().unwrap().errors.len(), 1);
        assert!(!s.conn.is_destroyed());

        let mut q2 = Qpack::new();
        s.conn.socket_mut().peer_open_bidi(4);
        let req2 = get_request(&mut q2, "/again");
        s.conn.socket_mut().deliver(4, &req2, true);
        drive(&mut s.conn).await;
        assert_eq!(s.requests.lock().unwrap().len(), 2);
    }

    // ------------------------------------------------------------------
    // 上行(客户端)

    #[tokio::test(start_paused = true)]
    async fn test_client_request_response() {
        let mut conn = setup_client("h3", Builder::new()).await;
        let ev = new_events();
        let id = conn
            .new_transaction(Box::new(TestHandler::new(ev.clone())))
            .unwrap()
            .unwrap();
        assert_eq!(id, 0);
        {
            let mut txn = conn.transaction(StreamKey::Stream(id)).unwrap();
            let req = Request::builder()
                .method("GET")
                .url("https://example.com/")
                .body(Binary::new())
                .unwrap();
            txn.send_headers(Message::Request(req), false).unwrap();
            txn.send_eom().unwrap();
        }
        drive(&mut conn).await;
        let written = conn.socket().written(0);
        assert!(!written.is_empty());
        assert!(conn.socket().fin_written(0));
        let frames = parse_frames(&written, false);
        assert_eq!(frames[0].0, Consts::FRAME_HEADERS);

        // 服务端只用静态表的响应
        let mut sq = Qpack::new();
        let mut bytes = headers_frame(&mut sq, &[(":status", "200")]);
        bytes.extend_from_slice(&data_frame(b"hello"));
        conn.socket_mut().deliver(0, &bytes, true);
        drive(&mut conn).await;
        {
            let ev = ev.lock().unwrap();
            assert_eq!(ev.headers, vec!["200".to_string()]);
            assert_eq!(ev.body, b"hello".to_vec());
            assert_eq!(ev.eom, 1);
        }

        assert!(conn.socket_mut().ack_next_delivery(0));
        drive(&mut conn).await;
        assert!(conn.socket_mut().ack_next_delivery(0));
        drive(&mut conn).await;
        assert_eq!(ev.lock().unwrap().detached, 1);
        assert_eq!(conn.number_of_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_handles_peer_goaway() {
        let mut conn = setup_client("h3", Builder::new()).await;
        let mut events = Vec::new();
        for _ in 0..3 {
            let ev = new_events();
            let id = conn
                .new_transaction(Box::new(TestHandler::new(ev.clone())))
                .unwrap()
                .unwrap();
            {
                let mut txn = conn.transaction(StreamKey::Stream(id)).unwrap();
                let req = Request::builder()
                    .method("GET")
                    .url("https://example.com/")
                    .body(Binary::new())
                    .unwrap();
                txn.send_headers(Message::Request(req), false).unwrap();
            }
            events.push((id, ev));
        }
        drive(&mut conn).await;
        assert_eq!(conn.number_of_streams(), 3);

        // 服务端控制流带来GOAWAY(maxStreamId=4)
        let mut ctrl = uni_preface(Consts::UNI_STREAM_CONTROL);
        ctrl.extend_from_slice(&goaway_frame(4));
        conn.socket_mut().peer_open_uni(3);
        conn.socket_mut().deliver(3, &ctrl, false);
        drive(&mut conn).await;

        for (id, ev) in &events {
            let ev = ev.lock().unwrap();
            if *id > 4 {
                // 上限外的事务拿到"未被确认, 可重试"
                assert_eq!(ev.errors.len(), 1, "stream {}", id);
                assert_eq!(ev.retryable_errors, 1);
            } else {
                assert!(ev.errors.is_empty(), "stream {}", id);
                assert_eq!(ev.goaway, 1);
            }
        }
        // 排空单调推进, 客户端最多发一个GOAWAY
        assert_eq!(conn.drain_state(), DrainState::Done);
        assert_eq!(goaways_on_control(&conn.socket().written(CLI_CTRL)).len(), 1);
        // 排空中拒绝新事务
        let refused = conn
            .new_transaction(Box::new(TestHandler::new(new_events())))
            .unwrap();
        assert!(refused.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_push_promise_and_binding() {
        let mut conn = setup_client("h3", Builder::new()).await;
        let parent_ev = new_events();
        let push_ev = new_events();
        let id = conn
            .new_transaction(Box::new(TestHandler {
                ev: parent_ev.clone(),
                respond: None,
                accept_push: Some(push_ev.clone()),
                push_on_eom: None,
            }))
            .unwrap()
            .unwrap();
        {
            let mut txn = conn.transaction(StreamKey::Stream(id)).unwrap();
            let req = Request::builder()
                .method("GET")
                .url("https://example.com/index.html")
                .body(Binary::new())
                .unwrap();
            txn.send_headers(Message::Request(req), false).unwrap();
            txn.send_eom().unwrap();
        }
        drive(&mut conn).await;

        // 响应流上先是推送承诺, 然后是响应本身
        let mut sq = Qpack::new();
        let mut bytes = push_promise_frame(
            &mut sq,
            0,
            &[
                (":method", "GET"),
                (":path", "/style.css"),
                (":scheme", "https"),
                (":authority", "example.com"),
            ],
        );
        bytes.extend_from_slice(&headers_frame(&mut sq, &[(":status", "200")]));
        conn.socket_mut().deliver(id, &bytes, true);
        drive(&mut conn).await;
        {
            let parent = parent_ev.lock().unwrap();
            assert_eq!(parent.push_promises, vec![0]);
            let push = push_ev.lock().unwrap();
            // 推送承诺里的请求头先交给推送事务
            assert_eq!(push.headers, vec!["GET /style.css".to_string()]);
        }
        assert!(conn.control().is_push_lookup_consistent());

        // 推送流本体到达并绑定
        let mut push_bytes = push_stream_preface(0);
        push_bytes.extend_from_slice(&headers_frame(&mut sq, &[(":status", "200")]));
        push_bytes.extend_from_slice(&data_frame(b"body-of-push"));
        conn.socket_mut().peer_open_uni(3);
        conn.socket_mut().deliver(3, &push_bytes, true);
        drive(&mut conn).await;
        {
            let push = push_ev.lock().unwrap();
            assert_eq!(push.headers.len(), 2);
            assert_eq!(push.body, b"body-of-push".to_vec());
            assert_eq!(push.eom, 1);
            assert_eq!(push.detached, 1);
        }
        assert!(conn.control().is_push_lookup_consistent());
        assert_eq!(conn.number_of_ingress_push_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_push() {
        let mut s = setup_server("h3", Builder::new(), Some((200, 0))).await;
        let push_ev = new_events();
        *s.push_on_eom.lock().unwrap() = Some(push_ev.clone());

        let mut q = Qpack::new();
        s.conn.socket_mut().peer_open_bidi(0);
        let req = get_request(&mut q, "/index.html");
        s.conn.socket_mut().deliver(0, &req, true);
        drive(&mut s.conn).await;

        let requests = s.requests.lock().unwrap().clone();
        let push_sid = requests[0].lock().unwrap().push_stream_id.unwrap();
        // 推送流在三条控制流之后创建
        assert_eq!(push_sid, 15);

        // 父流上有PUSH_PROMISE帧
        let parent_frames = parse_frames(&s.conn.socket().written(0), false);
        assert!(parent_frames
            .iter()
            .any(|(t, _)| *t == Consts::FRAME_PUSH_PROMISE));

        // 推送流上送响应
        {
            let mut txn = s.conn.transaction(StreamKey::Stream(push_sid)).unwrap();
            TestHandler::send_response(&mut txn, 200, 20);
        }
        drive(&mut s.conn).await;
        let pushed = s.conn.socket().written(push_sid);
        let (preface, n) = decode_varint(&pushed).unwrap();
        assert_eq!(preface, Consts::UNI_STREAM_PUSH);
        let (push_id, _) = decode_varint(&pushed[n..]).unwrap();
        assert_eq!(push_id, 0);
        assert!(s.conn.socket().fin_written(push_sid));
    }

    // ------------------------------------------------------------------
    // 桥接变体

    #[tokio::test(start_paused = true)]
    async fn test_v1_connection_close_drain() {
        let mut s = setup_server("h1q-fb", Builder::new(), Some((200, 13))).await;
        // V1没有控制流
        assert!(s.conn.socket().written(SRV_CTRL).is_empty());

        s.conn.socket_mut().peer_open_bidi(0);
        s.conn.socket_mut().deliver(
            0,
            b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
            true,
        );
        drive(&mut s.conn).await;

        let requests = s.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].lock().unwrap().eom, 1);

        // 应答上自动带了Connection: close, 两边都见过close后排空完成
        let written = s.conn.socket().written(0);
        let text = String::from_utf8_lossy(&written);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: close"));
        assert_eq!(s.conn.drain_state(), DrainState::Done);

        assert!(s.conn.socket_mut().ack_next_delivery(0));
        drive(&mut s.conn).await;
        assert!(s.conn.socket_mut().ack_next_delivery(0));
        drive(&mut s.conn).await;
        assert!(s.conn.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_v2_legacy_control_goaway() {
        let mut s = setup_server("h1q-fb-v2", Builder::new(), Some((200, 2))).await;
        // V2只有一条遗留控制流, 不发SETTINGS
        let ctrl_written = s.conn.socket().written(SRV_CTRL);
        assert!(!ctrl_written.is_empty());
        assert!(parse_frames(&ctrl_written, true).is_empty());

        s.conn.socket_mut().peer_open_bidi(0);
        s.conn
            .socket_mut()
            .deliver(0, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", true);
        drive(&mut s.conn).await;
        assert_eq!(s.requests.lock().unwrap().len(), 1);
        let text = String::from_utf8_lossy(&s.conn.socket().written(0)).to_string();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));

        s.conn.close_when_idle();
        drive(&mut s.conn).await;
        let goaways = goaways_on_control(&s.conn.socket().written(SRV_CTRL));
        assert_eq!(goaways, vec![Consts::EIGHT_BYTE_LIMIT]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_alpn_drops_connection() {
        let controller = TestController::new(None);
        let destroyed = controller.destroyed.clone();
        let sock = MockQuicSocket::new_server("h2");
        let mut conn = HqConnection::server(sock, Builder::new(), Box::new(controller));
        conn.socket_mut().transport_ready();
        drive(&mut conn).await;
        assert!(conn.is_destroyed());
        assert!(*destroyed.lock().unwrap());
    }
}
