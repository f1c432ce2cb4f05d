//! 행동 리스크 패턴 분석기.
//!
//! 청산된 포지션과 (있다면) 매매 일지를 읽어 다음 지표를 계산합니다:
//!
//! - 계획 없는 진입 수/비율, 계획/비계획 승률
//! - 감정적 재진입: 손실 청산 후 짧은 창 안에 같은 종목 재진입
//! - 충동 매매 연쇄: 같은 종목 진입이 짧은 창 간격으로 3회 이상 이어진 경우,
//!   첫 진입을 뺀 나머지 n-1회
//! - 손절 위반 (허용 오차 초과) 수/비율, 평균 슬리피지
//! - 조기 익절 수/비율
//! - 물타기 포지션 수/비율
//! - 평균 손익비, 전체/시간대별/시장 상황별 승률
//!
//! 비율은 퍼센트(소수 둘째 자리)이며 분모가 0이면 `None`입니다.
//! 일지 조회에 실패하면 일지에 의존하는 지표만 `None`으로 남기고 계산을 계속합니다.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::{debug, warn};
use trader_core::{LedgerStore, Position, PositionSide, RiskPattern, StoreError, TradingJournal};
use uuid::Uuid;

use crate::cache::RiskPatternCache;

/// 분석 에러.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("저장소 에러: {0}")]
    Store(#[from] StoreError),

    #[error("잘못된 분석 구간: {start} ~ {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// 분석기 설정.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// 감정적 재진입/충동 매매 판정 창
    pub short_window: Duration,
    /// 손절/익절 허용 오차 (0.003 = 0.3%)
    pub tolerance: Decimal,
    /// 기본 조회 기간
    pub default_lookback: Duration,
    /// 스냅샷 캐시 TTL (`None`이면 캐시 안 함)
    pub cache_ttl: Option<Duration>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            short_window: Duration::from_secs(15 * 60),
            tolerance: dec!(0.003),
            default_lookback: Duration::from_secs(30 * 24 * 60 * 60),
            cache_ttl: Some(Duration::from_secs(300)),
        }
    }
}

/// 리스크 패턴 분석기.
pub struct RiskPatternAnalyzer {
    store: Arc<dyn LedgerStore>,
    config: AnalyzerConfig,
    cache: Option<RiskPatternCache>,
}

impl RiskPatternAnalyzer {
    pub fn new(store: Arc<dyn LedgerStore>, config: AnalyzerConfig) -> Self {
        let cache = config.cache_ttl.map(RiskPatternCache::new);
        Self {
            store,
            config,
            cache,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// 기본 기간(현재 기준)의 스냅샷. 캐시가 있으면 재사용하고 계산 결과는 저장합니다.
    pub async fn snapshot(&self, user_id: Uuid) -> Result<RiskPattern, AnalyticsError> {
        if let Some(cached) = self.cached(user_id).await {
            debug!(user_id = %user_id, "리스크 패턴 캐시 적중");
            return Ok(cached);
        }

        let end = Utc::now();
        let lookback = chrono::Duration::from_std(self.config.default_lookback)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        let pattern = self.analyze(user_id, end - lookback, end).await?;

        if let Err(e) = self.store.save_risk_pattern(pattern.clone()).await {
            warn!(user_id = %user_id, error = %e, "리스크 패턴 저장 실패");
        }
        if let Some(cache) = &self.cache {
            cache.set(pattern.clone()).await;
        }
        Ok(pattern)
    }

    /// 캐시 무효화.
    pub async fn invalidate(&self, user_id: Uuid) {
        if let Some(cache) = &self.cache {
            cache.invalidate(user_id).await;
        }
    }

    async fn cached(&self, user_id: Uuid) -> Option<RiskPattern> {
        match &self.cache {
            Some(cache) => cache.get(user_id).await,
            None => None,
        }
    }

    /// 지정 기간 분석 (캐시/저장 없음).
    pub async fn analyze(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RiskPattern, AnalyticsError> {
        if start > end {
            return Err(AnalyticsError::InvalidWindow { start, end });
        }

        let positions = self.store.closed_positions(user_id, start, end).await?;
        let journals = match self.store.journals_for_user(user_id).await {
            Ok(journals) => Some(
                journals
                    .into_iter()
                    .map(|j| (j.position_id, j))
                    .collect::<HashMap<_, _>>(),
            ),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "매매 일지 조회 실패, 일지 기반 지표 생략");
                None
            }
        };

        Ok(self.compute(user_id, start, end, &positions, journals.as_ref()))
    }

    /// 순수 계산.
    pub fn compute(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        positions: &[Position],
        journals: Option<&HashMap<Uuid, TradingJournal>>,
    ) -> RiskPattern {
        let mut pattern = RiskPattern::empty(user_id, start, end);
        let total = positions.len() as u32;
        pattern.total_trades = total;
        if positions.is_empty() {
            if journals.is_some() {
                pattern.unplanned_entries = Some(0);
                pattern.stop_loss_violations = Some(0);
                pattern.early_take_profits = Some(0);
            }
            return pattern;
        }

        let window = chrono::Duration::from_std(self.config.short_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));

        // 계획 여부
        if let Some(journals) = journals {
            let (planned, unplanned): (Vec<&Position>, Vec<&Position>) = positions
                .iter()
                .partition(|p| journals.get(&p.id).is_some_and(|j| j.is_planned()));
            let unplanned_count = unplanned.len() as u32;
            pattern.unplanned_entries = Some(unplanned_count);
            pattern.unplanned_entry_rate = percentage(unplanned_count, total);
            pattern.planned_win_rate = win_rate(planned.iter().copied());
            pattern.unplanned_win_rate = win_rate(unplanned.iter().copied());
        }

        pattern.emotional_reentries = count_emotional_reentries(positions, window);
        pattern.emotional_reentry_rate = percentage(pattern.emotional_reentries, total);

        pattern.impulsive_trades = count_impulsive_trades(positions, window);
        pattern.impulsive_trade_rate = percentage(pattern.impulsive_trades, total);

        if let Some(journals) = journals {
            let stop = stop_loss_stats(positions, journals, self.config.tolerance);
            pattern.stop_loss_violations = Some(stop.violations);
            pattern.stop_loss_violation_rate = percentage(stop.violations, stop.eligible);
            pattern.avg_stop_loss_slippage = stop.avg_slippage;

            let (early, eligible) = early_take_profits(positions, journals, self.config.tolerance);
            pattern.early_take_profits = Some(early);
            pattern.early_take_profit_rate = percentage(early, eligible);
        }

        pattern.averaging_down_trades = positions
            .iter()
            .filter(|p| p.averaging_down_entries > 0)
            .count() as u32;
        pattern.averaging_down_rate = percentage(pattern.averaging_down_trades, total);

        pattern.avg_risk_reward = risk_reward(positions);
        pattern.overall_win_rate = win_rate(positions.iter());
        pattern.hourly_win_rates = bucket_win_rates(positions, |p| Some(p.entry_time.hour()));
        pattern.market_condition_win_rates =
            bucket_win_rates(positions, |p| p.market_condition.clone());

        debug!(
            user_id = %user_id,
            total_trades = total,
            impulsive = pattern.impulsive_trades,
            emotional = pattern.emotional_reentries,
            "리스크 패턴 계산 완료"
        );
        pattern
    }
}

// ==================== 지표 계산 ====================

/// 퍼센트 비율 (소수 둘째 자리). 분모가 0이면 `None`.
pub fn percentage(numerator: u32, denominator: u32) -> Option<Decimal> {
    if denominator == 0 {
        return None;
    }
    let value = Decimal::from(numerator) * Decimal::ONE_HUNDRED / Decimal::from(denominator);
    Some(round2(value))
}

fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// 손익이 확정된 포지션 중 수익 비율.
fn win_rate<'a>(positions: impl Iterator<Item = &'a Position>) -> Option<Decimal> {
    let (wins, decided) = positions.fold((0u32, 0u32), |(wins, decided), p| match p.is_win() {
        Some(true) => (wins + 1, decided + 1),
        Some(false) => (wins, decided + 1),
        None => (wins, decided),
    });
    percentage(wins, decided)
}

fn bucket_win_rates<K, F>(positions: &[Position], key: F) -> BTreeMap<K, Decimal>
where
    K: Ord,
    F: Fn(&Position) -> Option<K>,
{
    let mut buckets: BTreeMap<K, (u32, u32)> = BTreeMap::new();
    for position in positions {
        let (Some(bucket), Some(win)) = (key(position), position.is_win()) else {
            continue;
        };
        let entry = buckets.entry(bucket).or_default();
        entry.1 += 1;
        if win {
            entry.0 += 1;
        }
    }
    buckets
        .into_iter()
        .filter_map(|(bucket, (wins, total))| percentage(wins, total).map(|rate| (bucket, rate)))
        .collect()
}

/// 손실 청산 후 `window` 안에 같은 종목에 다시 진입한 포지션 수.
fn count_emotional_reentries(positions: &[Position], window: chrono::Duration) -> u32 {
    let mut reentries: HashSet<Uuid> = HashSet::new();
    for loss in positions.iter().filter(|p| p.is_win() == Some(false)) {
        let Some(exit_time) = loss.exit_time else {
            continue;
        };
        for next in positions.iter().filter(|p| {
            p.id != loss.id
                && p.symbol == loss.symbol
                && p.entry_time > exit_time
                && p.entry_time <= exit_time + window
        }) {
            reentries.insert(next.id);
        }
    }
    reentries.len() as u32
}

/// 같은 종목 진입이 `window` 간격 이내로 3회 이상 이어진 연쇄에서 첫 진입을 뺀 수.
fn count_impulsive_trades(positions: &[Position], window: chrono::Duration) -> u32 {
    let mut by_symbol: HashMap<&str, Vec<DateTime<Utc>>> = HashMap::new();
    for position in positions {
        by_symbol
            .entry(position.symbol.as_str())
            .or_default()
            .push(position.entry_time);
    }

    let mut count = 0;
    for entries in by_symbol.values_mut() {
        entries.sort();
        let mut chain = 1u32;
        for pair in entries.windows(2) {
            if pair[1] - pair[0] <= window {
                chain += 1;
            } else {
                count += impulsive_in_chain(chain);
                chain = 1;
            }
        }
        count += impulsive_in_chain(chain);
    }
    count
}

fn impulsive_in_chain(chain: u32) -> u32 {
    if chain >= 3 {
        chain - 1
    } else {
        0
    }
}

struct StopLossStats {
    eligible: u32,
    violations: u32,
    avg_slippage: Option<Decimal>,
}

/// 계획 손절가 (일지 우선, 없으면 포지션 값).
fn planned_stop(position: &Position, journals: &HashMap<Uuid, TradingJournal>) -> Option<Decimal> {
    journals
        .get(&position.id)
        .and_then(|j| j.planned_stop_price)
        .or(position.stop_price)
        .filter(|price| *price > Decimal::ZERO)
}

fn planned_target(
    position: &Position,
    journals: &HashMap<Uuid, TradingJournal>,
) -> Option<Decimal> {
    journals
        .get(&position.id)
        .and_then(|j| j.planned_target_price)
        .or(position.target_price)
        .filter(|price| *price > Decimal::ZERO)
}

/// 청산가가 기준가보다 허용 오차 이상 불리한지.
fn worse_than(side: PositionSide, exit: Decimal, reference: Decimal, tolerance: Decimal) -> bool {
    match side {
        PositionSide::Long => exit < reference * (Decimal::ONE - tolerance),
        PositionSide::Short => exit > reference * (Decimal::ONE + tolerance),
    }
}

fn stop_loss_stats(
    positions: &[Position],
    journals: &HashMap<Uuid, TradingJournal>,
    tolerance: Decimal,
) -> StopLossStats {
    let mut eligible = 0;
    let mut slippages = Vec::new();
    for position in positions {
        let (Some(stop), Some(exit)) = (planned_stop(position, journals), position.exit_price)
        else {
            continue;
        };
        eligible += 1;
        if worse_than(position.side, exit, stop, tolerance) {
            slippages.push((exit - stop).abs() / stop * Decimal::ONE_HUNDRED);
        }
    }

    let violations = slippages.len() as u32;
    let avg_slippage = (!slippages.is_empty()).then(|| {
        round2(slippages.iter().copied().sum::<Decimal>() / Decimal::from(violations))
    });
    StopLossStats {
        eligible,
        violations,
        avg_slippage,
    }
}

/// (조기 익절 수, 판정 대상 수익 포지션 수).
fn early_take_profits(
    positions: &[Position],
    journals: &HashMap<Uuid, TradingJournal>,
    tolerance: Decimal,
) -> (u32, u32) {
    let mut eligible = 0;
    let mut early = 0;
    for position in positions.iter().filter(|p| p.is_win() == Some(true)) {
        let (Some(target), Some(exit)) =
            (planned_target(position, journals), position.exit_price)
        else {
            continue;
        };
        eligible += 1;
        if worse_than(position.side, exit, target, tolerance) {
            early += 1;
        }
    }
    (early, eligible)
}

/// 평균 수익 ÷ 평균 손실 절대값.
fn risk_reward(positions: &[Position]) -> Option<Decimal> {
    let pnls: Vec<Decimal> = positions.iter().filter_map(|p| p.realized_pnl).collect();
    let wins: Vec<Decimal> = pnls.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
    let losses: Vec<Decimal> = pnls.iter().copied().filter(|p| *p < Decimal::ZERO).collect();
    if wins.is_empty() || losses.is_empty() {
        return None;
    }
    let avg_win = wins.iter().copied().sum::<Decimal>() / Decimal::from(wins.len() as u32);
    let avg_loss =
        losses.iter().map(|l| l.abs()).sum::<Decimal>() / Decimal::from(losses.len() as u32);
    if avg_loss.is_zero() {
        return None;
    }
    Some(round2(avg_win / avg_loss))
}
