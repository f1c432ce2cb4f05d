//! 자격증명별 스트리밍 세션 관리.
//!
//! 각 세션은 독립 태스크로 실행되며 다음 상태를 순환합니다.
//!
//! ```text
//! Disconnected → Connecting → Authenticating → Subscribed ⇄ Degraded
//!                                                  ↓
//!                                   Closing → Disconnected
//! ```
//!
//! - 실패(전송 에러, 인증 거부, 하트비트 누락)는 Degraded로 전환 후 백오프 재연결
//! - Subscribed 진입마다 REST 백필 1회 (REST 풀에서 실행, 수신 경로와 분리)
//! - listen key 거래소는 트래픽과 무관하게 주기적 keep-alive
//! - 취소 이후에는 이벤트를 전달하지 않음

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, RwLock},
    task::JoinHandle,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trader_core::{ApiCredential, ExchangeKind, RawFill, RawPosition};
use uuid::Uuid;

use crate::{
    adapter::{ExchangeAdapter, RestPool, StreamEvent, StreamTarget},
    retry::ReconnectBackoff,
    ExchangeError,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

// ==================== 상태 / 설정 ====================

/// 세션 연결 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    Degraded,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Authenticating => "AUTHENTICATING",
            Self::Subscribed => "SUBSCRIBED",
            Self::Degraded => "DEGRADED",
            Self::Closing => "CLOSING",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Subscribed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 세션 설정.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 재연결 최초 대기
    pub backoff_initial: Duration,
    /// 재연결 최대 대기
    pub backoff_max: Duration,
    /// 재연결 지터 비율 (0.0 ~ 1.0)
    pub backoff_jitter: f64,
    /// 하트비트 전송 주기
    pub heartbeat_interval: Duration,
    /// 연속 무응답 허용 횟수
    pub missed_heartbeats: u32,
    /// listen key 연장 주기
    pub keepalive_interval: Duration,
    /// 접속/인증/구독 응답 대기 시간
    pub handshake_timeout: Duration,
    /// 종료 시 세션당 대기 시간
    pub drain_timeout: Duration,
    /// 백필 조회 범위
    pub backfill_lookback: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_jitter: 0.2,
            heartbeat_interval: Duration::from_secs(20),
            missed_heartbeats: 3,
            keepalive_interval: Duration::from_secs(30 * 60),
            handshake_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            backfill_lookback: Duration::from_secs(60 * 60),
        }
    }
}

/// 세션이 전달하는 이벤트.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Fill {
        user_id: Uuid,
        credential_id: Uuid,
        fill: RawFill,
    },
    Position {
        user_id: Uuid,
        credential_id: Uuid,
        position: RawPosition,
    },
    /// REST 백필 결과 (배치 단위로 적용)
    Backfill {
        user_id: Uuid,
        credential_id: Uuid,
        fills: Vec<RawFill>,
    },
}

/// 세션 상태 요약.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHealth {
    pub credential_id: Uuid,
    pub user_id: Uuid,
    pub exchange: ExchangeKind,
    pub state: ConnectionState,
    pub reconnects: u64,
    pub keepalive_failures: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct SessionStats {
    reconnects: AtomicU64,
    keepalive_failures: AtomicU64,
    last_error: RwLock<Option<String>>,
}

struct SessionHandle {
    order: u64,
    user_id: Uuid,
    exchange: ExchangeKind,
    cancel: CancellationToken,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<SessionStats>,
    backfill_tx: mpsc::Sender<Vec<String>>,
    task: JoinHandle<()>,
}

// ==================== ConnectionManager ====================

/// 자격증명별 세션 태스크 관리자.
pub struct ConnectionManager {
    rest: RestPool,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    next_order: AtomicU64,
}

impl ConnectionManager {
    pub fn new(rest: RestPool, config: SessionConfig, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            rest,
            config,
            events,
            sessions: RwLock::new(HashMap::new()),
            next_order: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// 세션 시작. 이미 실행 중이면 기존 상태 채널을 반환합니다.
    pub async fn start(
        &self,
        credential: ApiCredential,
        adapter: ExchangeAdapter,
    ) -> watch::Receiver<ConnectionState> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&credential.credential_id) {
            if !existing.task.is_finished() {
                return existing.state.clone();
            }
        }

        let credential_id = credential.credential_id;
        let user_id = credential.user_id;
        let exchange = adapter.kind();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (backfill_tx, backfill_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let stats = Arc::new(SessionStats::default());

        let session = Session {
            credential: Arc::new(credential),
            adapter,
            rest: self.rest.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
            state: state_tx,
            stats: stats.clone(),
        };
        let task = tokio::spawn(session.run(backfill_rx));

        info!(
            credential_id = %credential_id,
            user_id = %user_id,
            exchange = %exchange,
            "세션 시작"
        );

        sessions.insert(
            credential_id,
            SessionHandle {
                order: self.next_order.fetch_add(1, Ordering::SeqCst),
                user_id,
                exchange,
                cancel,
                state: state_rx.clone(),
                stats,
                backfill_tx,
                task,
            },
        );
        state_rx
    }

    /// 실행 중인 세션의 자격증명 ID 목록.
    pub async fn credential_ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn state(&self, credential_id: Uuid) -> Option<ConnectionState> {
        self.sessions
            .read()
            .await
            .get(&credential_id)
            .map(|h| *h.state.borrow())
    }

    /// 세션 하나를 비활성화하고 종료될 때까지 대기.
    ///
    /// 세션이 없으면 `false`.
    pub async fn deactivate(&self, credential_id: Uuid) -> bool {
        let handle = self.sessions.write().await.remove(&credential_id);
        match handle {
            Some(handle) => {
                info!(credential_id = %credential_id, "세션 비활성화");
                self.drain(credential_id, handle).await;
                true
            }
            None => false,
        }
    }

    /// 모든 세션을 시작 순서대로 종료.
    pub async fn shutdown(&self) {
        let mut handles: Vec<(Uuid, SessionHandle)> =
            self.sessions.write().await.drain().collect();
        handles.sort_by_key(|(_, h)| h.order);
        info!(sessions = handles.len(), "전체 세션 종료 시작");
        for (credential_id, handle) in handles {
            self.drain(credential_id, handle).await;
        }
        info!("전체 세션 종료 완료");
    }

    async fn drain(&self, credential_id: Uuid, handle: SessionHandle) {
        handle.cancel.cancel();
        let mut state = handle.state.clone();
        let timed_out = timeout(
            self.config.drain_timeout,
            state.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .is_err();
        if timed_out {
            warn!(
                credential_id = %credential_id,
                timeout_ms = self.config.drain_timeout.as_millis() as u64,
                "세션 종료 대기 시간 초과, 강제 중단"
            );
            handle.task.abort();
        }
    }

    /// 세션 상태 스냅샷.
    pub async fn health(&self) -> Vec<SessionHealth> {
        let sessions = self.sessions.read().await;
        let mut result = Vec::with_capacity(sessions.len());
        for (credential_id, handle) in sessions.iter() {
            let state = *handle.state.borrow();
            result.push(SessionHealth {
                credential_id: *credential_id,
                user_id: handle.user_id,
                exchange: handle.exchange,
                state,
                reconnects: handle.stats.reconnects.load(Ordering::Relaxed),
                keepalive_failures: handle.stats.keepalive_failures.load(Ordering::Relaxed),
                last_error: handle.stats.last_error.read().await.clone(),
            });
        }
        result.sort_by_key(|h| h.credential_id);
        result
    }

    /// 사용자/거래소의 모든 세션에 백필 요청.
    ///
    /// 요청을 전달한 세션 수를 반환합니다.
    pub async fn request_backfill(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbols: Vec<String>,
    ) -> usize {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;
        for handle in sessions
            .values()
            .filter(|h| h.user_id == user_id && h.exchange == exchange)
        {
            if handle.backfill_tx.try_send(symbols.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

// ==================== 세션 태스크 ====================

/// 한 번의 연결이 끝난 이유.
enum SessionEnd {
    /// 취소 요청
    Cancelled,
    /// 이벤트 수신자 종료
    Stopped,
}

struct Session {
    credential: Arc<ApiCredential>,
    adapter: ExchangeAdapter,
    rest: RestPool,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    state: watch::Sender<ConnectionState>,
    stats: Arc<SessionStats>,
}

impl Session {
    async fn run(self, mut backfill_rx: mpsc::Receiver<Vec<String>>) {
        let mut backoff =
            ReconnectBackoff::new(self.config.backoff_initial, self.config.backoff_max)
                .with_jitter(self.config.backoff_jitter);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            match self.connect_once(&mut backoff, &mut backfill_rx).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::Stopped) => {
                    warn!(credential_id = %self.credential.credential_id, "이벤트 수신자 종료, 세션 중단");
                    break;
                }
                Err(e) => {
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    *self.stats.last_error.write().await = Some(e.to_string());
                    self.set_state(ConnectionState::Degraded);

                    let delay = e
                        .retry_delay_ms()
                        .map(Duration::from_millis)
                        .unwrap_or_default()
                        .max(backoff.next_delay());
                    warn!(
                        credential_id = %self.credential.credential_id,
                        exchange = %self.adapter.kind(),
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        fatal = e.is_fatal(),
                        error = %e,
                        "세션 실패, 재연결 예약"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.set_state(ConnectionState::Closing);
        self.set_state(ConnectionState::Disconnected);
        info!(credential_id = %self.credential.credential_id, "세션 종료");
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(
                credential_id = %self.credential.credential_id,
                from = %previous,
                to = %state,
                "세션 상태 전이"
            );
        }
    }

    /// 접속 → 인증 → 구독 → 수신 루프.
    async fn connect_once(
        &self,
        backoff: &mut ReconnectBackoff,
        backfill_rx: &mut mpsc::Receiver<Vec<String>>,
    ) -> Result<SessionEnd, ExchangeError> {
        let target = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            target = self.adapter.prepare_stream(&self.rest, &self.credential) => target?,
        };

        let connect = timeout(self.config.handshake_timeout, connect_async(target.url.as_str()));
        let (ws, _) = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            result = connect => result
                .map_err(|_| ExchangeError::Timeout("WebSocket 접속".to_string()))??,
        };
        let (mut sink, mut source) = ws.split();
        debug!(credential_id = %self.credential.credential_id, url = %target.url, "WebSocket 연결");

        // 인증
        if let Some(login) = self.adapter.login_message(&self.credential, Utc::now())? {
            self.set_state(ConnectionState::Authenticating);
            sink.send(Message::Text(login)).await?;
            match self
                .await_control(&mut sink, &mut source, |e| *e == StreamEvent::Authenticated)
                .await?
            {
                Some(end) => return Ok(end),
                None => debug!(credential_id = %self.credential.credential_id, "인증 완료"),
            }
        }

        // 구독 (재연결 시 동일 메시지 재전송)
        let subscriptions = self.adapter.subscribe_messages();
        if !subscriptions.is_empty() {
            for message in subscriptions {
                sink.send(Message::Text(message)).await?;
            }
            if let Some(end) = self
                .await_control(&mut sink, &mut source, |e| *e == StreamEvent::Subscribed)
                .await?
            {
                return Ok(end);
            }
        }

        self.set_state(ConnectionState::Subscribed);
        backoff.reset();
        info!(
            credential_id = %self.credential.credential_id,
            exchange = %self.adapter.kind(),
            "구독 완료"
        );
        self.spawn_backfill(Vec::new());

        self.receive_loop(&mut sink, &mut source, &target, backfill_rx)
            .await
    }

    /// 인증/구독 응답 대기. 대기 중 도착한 체결은 그대로 전달합니다.
    async fn await_control<F>(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
        done: F,
    ) -> Result<Option<SessionEnd>, ExchangeError>
    where
        F: Fn(&StreamEvent) -> bool,
    {
        let deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Some(SessionEnd::Cancelled)),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ExchangeError::Timeout("인증/구독 응답".to_string()));
                }
                frame = source.next() => frame,
            };
            let text = match frame {
                None => return Err(ExchangeError::Disconnected("핸드셰이크 중 연결 종료".to_string())),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Ping(payload))) => {
                    sink.send(Message::Pong(payload)).await?;
                    continue;
                }
                Some(Ok(Message::Close(_))) => {
                    return Err(ExchangeError::Disconnected("서버가 연결 종료".to_string()))
                }
                Some(Ok(_)) => continue,
            };

            // 거래소가 명시적으로 거부한 제어 응답만 핸드셰이크 실패로 처리
            let events = match self.adapter.parse_message(&text) {
                Ok(events) => events,
                Err(e @ ExchangeError::Api { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        credential_id = %self.credential.credential_id,
                        error = %e,
                        "핸드셰이크 중 메시지 해석 실패, 무시"
                    );
                    continue;
                }
            };
            for event in events {
                if done(&event) {
                    return Ok(None);
                }
                match event {
                    StreamEvent::AuthRejected(reason) => {
                        return Err(ExchangeError::AuthRejected(reason))
                    }
                    other => {
                        if !self.forward_stream_event(other).await {
                            return Ok(Some(SessionEnd::Stopped));
                        }
                    }
                }
            }
        }
    }

    async fn receive_loop(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
        target: &StreamTarget,
        backfill_rx: &mut mpsc::Receiver<Vec<String>>,
    ) -> Result<SessionEnd, ExchangeError> {
        let heartbeat_every = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let keepalive_every = self.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + keepalive_every, keepalive_every);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let uses_keepalive = self.adapter.needs_keepalive() && target.listen_key.is_some();
        let mut missed: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.set_state(ConnectionState::Closing);
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Cancelled);
                }
                frame = source.next() => {
                    let text = match frame {
                        None => return Err(ExchangeError::Disconnected("스트림 종료".to_string())),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(payload))) => {
                            missed = 0;
                            sink.send(Message::Pong(payload)).await?;
                            continue;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            missed = 0;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) => {
                            return Err(ExchangeError::Disconnected("서버가 연결 종료".to_string()));
                        }
                        Some(Ok(_)) => continue,
                    };
                    missed = 0;

                    let events = match self.adapter.parse_message(&text) {
                        Ok(events) => events,
                        Err(e) => {
                            warn!(
                                credential_id = %self.credential.credential_id,
                                error = %e,
                                "메시지 해석 실패, 무시"
                            );
                            continue;
                        }
                    };
                    for event in events {
                        match event {
                            StreamEvent::ListenKeyExpired => {
                                return Err(ExchangeError::ListenKeyExpired);
                            }
                            StreamEvent::AuthRejected(reason) => {
                                return Err(ExchangeError::AuthRejected(reason));
                            }
                            other => {
                                if !self.forward_stream_event(other).await {
                                    return Ok(SessionEnd::Stopped);
                                }
                            }
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if missed >= self.config.missed_heartbeats {
                        return Err(ExchangeError::Timeout(format!("하트비트 {}회 무응답", missed)));
                    }
                    missed += 1;
                    sink.send(self.adapter.heartbeat_message()).await?;
                }
                _ = keepalive.tick(), if uses_keepalive => {
                    self.spawn_keepalive(target.clone());
                }
                Some(symbols) = backfill_rx.recv() => {
                    self.spawn_backfill(symbols);
                }
            }
        }
    }

    /// 체결/포지션만 전달하고 나머지 제어 이벤트는 버림.
    ///
    /// 수신자가 닫혔으면 `false`.
    async fn forward_stream_event(&self, event: StreamEvent) -> bool {
        let user_id = self.credential.user_id;
        let credential_id = self.credential.credential_id;
        let event = match event {
            StreamEvent::Fill(fill) => SessionEvent::Fill {
                user_id,
                credential_id,
                fill,
            },
            StreamEvent::Position(position) => SessionEvent::Position {
                user_id,
                credential_id,
                position,
            },
            _ => return true,
        };
        forward(&self.cancel, &self.events, event).await
    }

    /// REST 풀에서 백필 실행. 결과는 배치로 전달합니다.
    fn spawn_backfill(&self, symbols: Vec<String>) {
        let adapter = self.adapter.clone();
        let rest = self.rest.clone();
        let credential = self.credential.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let lookback = chrono::Duration::from_std(self.config.backfill_lookback)
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        tokio::spawn(async move {
            let since = Utc::now() - lookback;
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = adapter.fetch_recent_fills(&rest, &credential, since, &symbols) => result,
            };
            match result {
                Ok(fills) => {
                    info!(
                        credential_id = %credential.credential_id,
                        exchange = %adapter.kind(),
                        fills = fills.len(),
                        "백필 완료"
                    );
                    let event = SessionEvent::Backfill {
                        user_id: credential.user_id,
                        credential_id: credential.credential_id,
                        fills,
                    };
                    forward(&cancel, &events, event).await;
                }
                Err(e) => warn!(
                    credential_id = %credential.credential_id,
                    exchange = %adapter.kind(),
                    error = %e,
                    "백필 실패"
                ),
            }
        });
    }

    /// listen key 연장. 실패는 집계만 하고 세션은 유지합니다.
    fn spawn_keepalive(&self, target: StreamTarget) {
        let adapter = self.adapter.clone();
        let rest = self.rest.clone();
        let credential = self.credential.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            if let Err(e) = adapter.keepalive(&rest, &credential, &target).await {
                let failures = stats.keepalive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                *stats.last_error.write().await = Some(e.to_string());
                warn!(
                    credential_id = %credential.credential_id,
                    failures,
                    error = %e,
                    "listen key 연장 실패"
                );
            } else {
                debug!(credential_id = %credential.credential_id, "listen key 연장");
            }
        });
    }
}

/// 취소되지 않은 경우에만 이벤트 전달.
async fn forward(
    cancel: &CancellationToken,
    events: &mpsc::Sender<SessionEvent>,
    event: SessionEvent,
) -> bool {
    if cancel.is_cancelled() {
        return true;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        sent = events.send(event) => sent.is_ok(),
    }
}
