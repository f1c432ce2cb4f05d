//! 키 단위 직렬화 정합성 엔진.
//!
//! # 아키텍처
//!
//! ```text
//! ConnectionManager ── SessionEvent ──> ReconciliationEngine
//!                                          │ (user, exchange, symbol)별 워커
//!                                          ├── worker[BTCUSDT] ── Reconciler ──> LedgerStore
//!                                          └── worker[ETHUSDT] ── Reconciler ──> LedgerStore
//! ```
//!
//! 같은 키의 이벤트는 하나의 워커 태스크에서 순서대로 처리되고,
//! 서로 다른 키는 병렬로 처리됩니다. 실시간 체결은 짧은 재정렬 창에 모았다가,
//! 백필 배치는 받는 즉시 (타임스탬프, 시퀀스, 도착 순)으로 정렬해 적용합니다.
//!
//! 저장소 일시 오류로 실패한 체결은 뒤따르는 체결과 함께 대기열로 돌아가
//! `retry_delay` 후 다시 적용됩니다. 같은 체결이 `max_fill_attempts`번 실패하면 폐기합니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};
use trader_core::{ExchangeKind, LedgerStore, Order, RawFill, RawPosition};
use uuid::Uuid;

use crate::error::ReconcileError;
use crate::reconciler::{FillOutcome, Reconciler, RetryDecision};

/// 엔진 설정.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 실시간 체결 재정렬 창
    pub reorder_window: Duration,
    /// flat 스냅샷 이후 청산 체결을 기다리는 시간
    pub closing_timeout: Duration,
    /// 키 워커 채널 용량
    pub worker_capacity: usize,
    /// 체결 하나에 대한 최대 적용 시도 횟수
    pub max_fill_attempts: u32,
    /// 실패한 체결 재적용 대기 시간
    pub retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reorder_window: Duration::from_millis(250),
            closing_timeout: Duration::from_secs(30),
            worker_capacity: 256,
            max_fill_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// 직렬화 키.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub user_id: Uuid,
    pub exchange: ExchangeKind,
    pub symbol: String,
}

impl LedgerKey {
    pub fn new(user_id: Uuid, exchange: ExchangeKind, symbol: impl Into<String>) -> Self {
        Self {
            user_id,
            exchange,
            symbol: symbol.into(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, ReconcileError>>;

enum KeyCommand {
    Fill(PendingFill),
    Batch(Vec<PendingFill>),
    Snapshot(RawPosition),
    ExpireClosing {
        position_id: Uuid,
        now: DateTime<Utc>,
        reply: Reply<bool>,
    },
    RetryUnmapped {
        position_id: Uuid,
        max_retries: u32,
        reply: Reply<RetryDecision>,
    },
    RemapOrphan {
        order: Order,
        reply: Reply<bool>,
    },
    Flush(oneshot::Sender<()>),
}

struct PendingFill {
    fill: RawFill,
    arrival: u64,
    /// 실패한 적용 시도 횟수
    failures: u32,
}

#[derive(Default)]
struct WorkerTable {
    senders: HashMap<LedgerKey, mpsc::Sender<KeyCommand>>,
    handles: Vec<JoinHandle<()>>,
    closed: bool,
}

// ==================== ReconciliationEngine ====================

/// 체결/스냅샷을 키별 워커로 분배하는 정합성 엔진.
pub struct ReconciliationEngine {
    reconciler: Arc<Reconciler>,
    config: EngineConfig,
    workers: Mutex<WorkerTable>,
    arrivals: AtomicU64,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn LedgerStore>, config: EngineConfig) -> Self {
        let closing_timeout = chrono::Duration::from_std(config.closing_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Self {
            reconciler: Arc::new(Reconciler::new(store, closing_timeout)),
            config,
            workers: Mutex::new(WorkerTable::default()),
            arrivals: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        self.reconciler.store()
    }

    /// 실시간 체결 제출.
    pub async fn submit_fill(&self, user_id: Uuid, fill: RawFill) -> Result<(), ReconcileError> {
        let key = LedgerKey::new(user_id, fill.exchange, fill.symbol.clone());
        let pending = self.pending(fill);
        self.send(&key, KeyCommand::Fill(pending)).await
    }

    /// 백필 배치 제출. 키별로 나눠 각 워커에서 정렬 후 적용됩니다.
    pub async fn submit_backfill(
        &self,
        user_id: Uuid,
        fills: Vec<RawFill>,
    ) -> Result<(), ReconcileError> {
        let mut batches: HashMap<LedgerKey, Vec<PendingFill>> = HashMap::new();
        for fill in fills {
            let key = LedgerKey::new(user_id, fill.exchange, fill.symbol.clone());
            let pending = self.pending(fill);
            batches.entry(key).or_default().push(pending);
        }
        for (key, batch) in batches {
            debug!(user_id = %user_id, symbol = %key.symbol, count = batch.len(), "백필 배치 제출");
            self.send(&key, KeyCommand::Batch(batch)).await?;
        }
        Ok(())
    }

    /// 거래소 포지션 스냅샷 제출.
    pub async fn submit_snapshot(
        &self,
        user_id: Uuid,
        snapshot: RawPosition,
    ) -> Result<(), ReconcileError> {
        let key = LedgerKey::new(user_id, snapshot.exchange, snapshot.symbol.clone());
        self.send(&key, KeyCommand::Snapshot(snapshot)).await
    }

    /// CLOSING 기한 만료 처리 (키 워커에서 실행).
    pub async fn expire_closing(
        &self,
        key: &LedgerKey,
        position_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ReconcileError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            key,
            KeyCommand::ExpireClosing {
                position_id,
                now,
                reply,
            },
        )
        .await?;
        rx.await.map_err(|_| ReconcileError::ShutDown)?
    }

    /// CLOSED_UNMAPPED 재시도 판정 (키 워커에서 실행).
    pub async fn retry_unmapped(
        &self,
        key: &LedgerKey,
        position_id: Uuid,
        max_retries: u32,
    ) -> Result<RetryDecision, ReconcileError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            key,
            KeyCommand::RetryUnmapped {
                position_id,
                max_retries,
                reply,
            },
        )
        .await?;
        rx.await.map_err(|_| ReconcileError::ShutDown)?
    }

    /// 고아 주문 재매핑 (키 워커에서 실행).
    pub async fn remap_orphan(&self, order: Order) -> Result<bool, ReconcileError> {
        let key = LedgerKey::new(order.user_id, order.exchange, order.symbol.clone());
        let (reply, rx) = oneshot::channel();
        self.send(&key, KeyCommand::RemapOrphan { order, reply })
            .await?;
        rx.await.map_err(|_| ReconcileError::ShutDown)?
    }

    /// 모든 워커의 대기 중 체결을 즉시 적용하고 완료를 기다림.
    pub async fn flush(&self) {
        let senders: Vec<_> = self.workers.lock().await.senders.values().cloned().collect();
        for sender in senders {
            let (tx, rx) = oneshot::channel();
            if sender.send(KeyCommand::Flush(tx)).await.is_ok() {
                let _ = rx.await;
            }
        }
    }

    /// 활성 워커 수.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.senders.len()
    }

    /// 엔진 종료. 워커가 남은 체결을 적용하도록 최대 `drain_timeout`까지 기다립니다.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let handles = {
            let mut table = self.workers.lock().await;
            table.closed = true;
            table.senders.clear();
            std::mem::take(&mut table.handles)
        };

        let count = handles.len();
        for mut handle in handles {
            if timeout(drain_timeout, &mut handle).await.is_err() {
                warn!("정합성 워커 drain 시간 초과, 강제 종료");
                handle.abort();
            }
        }
        info!(workers = count, "정합성 엔진 종료");
    }

    fn pending(&self, fill: RawFill) -> PendingFill {
        PendingFill {
            fill,
            arrival: self.arrivals.fetch_add(1, Ordering::Relaxed),
            failures: 0,
        }
    }

    async fn send(&self, key: &LedgerKey, command: KeyCommand) -> Result<(), ReconcileError> {
        let sender = {
            let mut table = self.workers.lock().await;
            if table.closed {
                return Err(ReconcileError::ShutDown);
            }
            match table.senders.get(key) {
                Some(sender) if !sender.is_closed() => sender.clone(),
                _ => {
                    let (tx, rx) = mpsc::channel(self.config.worker_capacity.max(1));
                    let worker = KeyWorker {
                        key: key.clone(),
                        reconciler: self.reconciler.clone(),
                        window: self.config.reorder_window,
                        max_attempts: self.config.max_fill_attempts.max(1),
                        retry_delay: self.config.retry_delay,
                        pending: Vec::new(),
                    };
                    table.handles.push(tokio::spawn(worker.run(rx)));
                    table.senders.insert(key.clone(), tx.clone());
                    debug!(
                        user_id = %key.user_id,
                        exchange = %key.exchange,
                        symbol = %key.symbol,
                        "키 워커 생성"
                    );
                    tx
                }
            }
        };
        sender
            .send(command)
            .await
            .map_err(|_| ReconcileError::ShutDown)
    }
}

// ==================== 키 워커 ====================

struct KeyWorker {
    key: LedgerKey,
    reconciler: Arc<Reconciler>,
    window: Duration,
    max_attempts: u32,
    retry_delay: Duration,
    pending: Vec<PendingFill>,
}

/// drain 결과.
#[derive(Debug, PartialEq, Eq)]
enum DrainResult {
    Done,
    /// 일시 오류로 대기열에 되돌린 체결이 있음
    Requeued,
}

impl KeyWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<KeyCommand>) {
        let mut deadline: Option<Instant> = None;

        loop {
            let command = match deadline {
                Some(at) => tokio::select! {
                    command = rx.recv() => command,
                    _ = tokio::time::sleep_until(at) => {
                        deadline = self.drain_and_schedule().await;
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            let Some(command) = command else {
                // 종료 시 재시도 한도 안에서 남은 체결 적용
                while self.drain().await == DrainResult::Requeued {
                    tokio::time::sleep(self.retry_delay).await;
                }
                break;
            };

            match command {
                KeyCommand::Fill(pending) => {
                    self.pending.push(pending);
                    if self.window.is_zero() {
                        deadline = self.drain_and_schedule().await;
                    } else if deadline.is_none() {
                        deadline = Some(Instant::now() + self.window);
                    }
                }
                KeyCommand::Batch(batch) => {
                    self.pending.extend(batch);
                    deadline = self.drain_and_schedule().await;
                }
                other => {
                    // 제어 명령 전에 모아둔 체결부터 반영
                    deadline = self.drain_and_schedule().await;
                    self.execute(other).await;
                }
            }
        }

        debug!(symbol = %self.key.symbol, "키 워커 종료");
    }

    /// drain 후 되돌린 체결이 있으면 재시도 시각 반환.
    async fn drain_and_schedule(&mut self) -> Option<Instant> {
        match self.drain().await {
            DrainResult::Requeued => Some(Instant::now() + self.retry_delay),
            DrainResult::Done => None,
        }
    }

    /// 대기 중 체결을 정렬해 적용.
    ///
    /// 재시도 가능한 실패가 나면 그 체결과 뒤의 체결을 순서 그대로 대기열에 되돌립니다.
    async fn drain(&mut self) -> DrainResult {
        if self.pending.is_empty() {
            return DrainResult::Done;
        }
        let mut batch = std::mem::take(&mut self.pending);
        batch.sort_by(|a, b| {
            a.fill
                .ordering_key()
                .cmp(&b.fill.ordering_key())
                .then(a.arrival.cmp(&b.arrival))
        });

        let mut fills = batch.into_iter();
        while let Some(mut pending) = fills.next() {
            let fill = &pending.fill;
            match self.reconciler.apply_fill(self.key.user_id, fill).await {
                Ok(FillOutcome::Orphaned(conflict)) => {
                    debug!(conflict = %conflict, "고아 주문 기록");
                }
                Ok(outcome) => {
                    debug!(order_id = %fill.exchange_order_id, outcome = ?outcome, "체결 반영");
                }
                Err(e) if e.is_retryable() && pending.failures + 1 < self.max_attempts => {
                    pending.failures += 1;
                    warn!(
                        user_id = %self.key.user_id,
                        symbol = %self.key.symbol,
                        order_id = %pending.fill.exchange_order_id,
                        attempt = pending.failures,
                        error = %e,
                        "체결 반영 실패, 재시도 예정"
                    );
                    // 도착한 새 체결과 합쳐 다음 drain에서 다시 정렬
                    self.pending.push(pending);
                    self.pending.extend(fills);
                    return DrainResult::Requeued;
                }
                Err(e) => {
                    error!(
                        user_id = %self.key.user_id,
                        exchange = %self.key.exchange,
                        symbol = %self.key.symbol,
                        order_id = %fill.exchange_order_id,
                        attempts = pending.failures + 1,
                        error = %e,
                        "체결 반영 실패, 폐기"
                    );
                }
            }
        }
        DrainResult::Done
    }

    async fn execute(&mut self, command: KeyCommand) {
        match command {
            KeyCommand::Snapshot(snapshot) => {
                if let Err(e) = self
                    .reconciler
                    .apply_snapshot(self.key.user_id, &snapshot, Utc::now())
                    .await
                {
                    error!(symbol = %self.key.symbol, error = %e, "스냅샷 반영 실패");
                }
            }
            KeyCommand::ExpireClosing {
                position_id,
                now,
                reply,
            } => {
                let _ = reply.send(self.reconciler.expire_closing(position_id, now).await);
            }
            KeyCommand::RetryUnmapped {
                position_id,
                max_retries,
                reply,
            } => {
                let _ = reply.send(
                    self.reconciler
                        .retry_unmapped(position_id, max_retries)
                        .await,
                );
            }
            KeyCommand::RemapOrphan { order, reply } => {
                let _ = reply.send(self.reconciler.remap_orphan(order).await);
            }
            KeyCommand::Flush(done) => {
                let _ = done.send(());
            }
            KeyCommand::Fill(_) | KeyCommand::Batch(_) => {}
        }
    }
}
