//! 자격증명 동기화 통계.

use std::time::Duration;

/// 자격증명 동기화 1회 통계
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    /// 활성 자격증명 수
    pub active: usize,
    /// 새로 시작한 세션 수
    pub started: usize,
    /// 비활성화로 종료한 세션 수
    pub stopped: usize,
    /// 이미 실행 중이던 세션 수
    pub unchanged: usize,
    /// 복호화/설정 실패 수
    pub errors: usize,
    /// 소요 시간
    pub elapsed: Duration,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 변경이 있었는지 (시작/종료/실패).
    pub fn has_changes(&self) -> bool {
        self.started > 0 || self.stopped > 0 || self.errors > 0
    }

    /// 통계 요약 로그 출력
    ///
    /// 변경이 없으면 debug 레벨로만 남깁니다.
    pub fn log_summary(&self, operation: &str) {
        if self.has_changes() {
            tracing::info!(
                operation = operation,
                active = self.active,
                started = self.started,
                stopped = self.stopped,
                unchanged = self.unchanged,
                errors = self.errors,
                elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
                "자격증명 동기화 완료"
            );
        } else {
            tracing::debug!(
                operation = operation,
                active = self.active,
                "자격증명 변경 없음"
            );
        }
    }
}
