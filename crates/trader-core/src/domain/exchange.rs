//! 거래소 식별자 및 방향 타입.
//!
//! 거래소마다 다른 매수/매도, 롱/숏, 진입/청산 표현을
//! 하나의 중립 어휘로 정규화하기 위한 기본 타입입니다.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

// =============================================================================
// 거래소 종류
// =============================================================================

/// 지원 거래소.
///
/// 거래소별 서명/파싱 로직은 이 태그로 분기합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Binance,
    Bybit,
    Bitget,
}

impl ExchangeKind {
    /// 저장/로그용 소문자 이름.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bybit => "bybit",
            Self::Bitget => "bitget",
        }
    }

    /// API passphrase 필요 여부 (Bitget만 필요).
    pub fn requires_passphrase(&self) -> bool {
        matches!(self, Self::Bitget)
    }

    /// 주기적으로 갱신해야 하는 세션 토큰(listen key) 사용 여부.
    pub fn uses_listen_key(&self) -> bool {
        matches!(self, Self::Binance)
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "bybit" => Ok(Self::Bybit),
            "bitget" => Ok(Self::Bitget),
            other => Err(format!("지원하지 않는 거래소: {}", other)),
        }
    }
}

// =============================================================================
// 주문 방향
// =============================================================================

/// 주문 방향 (매수/매도).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// 거래소 표기("Buy", "buy", "BUY")를 대소문자 구분 없이 파싱.
    pub fn parse_loose(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_loose(s).ok_or_else(|| format!("알 수 없는 주문 방향: {}", s))
    }
}

// =============================================================================
// 포지션 방향
// =============================================================================

/// 포지션 방향 (롱/숏).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LONG" => Ok(Self::Long),
            "SHORT" => Ok(Self::Short),
            other => Err(format!("알 수 없는 포지션 방향: {}", other)),
        }
    }
}

// =============================================================================
// 체결 효과 (진입/청산)
// =============================================================================

/// 체결이 포지션 노출을 여는지 닫는지.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionEffect {
    Open,
    Close,
}

impl PositionEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
        }
    }

    /// 체결 방향과 효과로 대상 포지션 방향을 결정.
    ///
    /// 헤지 모드 슬롯(1=롱, 2=숏)이 지정되면 그 값을 우선합니다.
    pub fn target_side(&self, side: Side, position_index: u8) -> PositionSide {
        match position_index {
            1 => return PositionSide::Long,
            2 => return PositionSide::Short,
            _ => {}
        }
        match (self, side) {
            (Self::Open, Side::Buy) | (Self::Close, Side::Sell) => PositionSide::Long,
            (Self::Open, Side::Sell) | (Self::Close, Side::Buy) => PositionSide::Short,
        }
    }
}

impl fmt::Display for PositionEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionEffect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "OPEN" => Ok(Self::Open),
            "CLOSE" => Ok(Self::Close),
            other => Err(format!("알 수 없는 체결 효과: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_side_one_way() {
        assert_eq!(
            PositionEffect::Open.target_side(Side::Buy, 0),
            PositionSide::Long
        );
        assert_eq!(
            PositionEffect::Close.target_side(Side::Buy, 0),
            PositionSide::Short
        );
        assert_eq!(
            PositionEffect::Close.target_side(Side::Sell, 0),
            PositionSide::Long
        );
    }

    #[test]
    fn test_target_side_hedge_slot_wins() {
        // 헤지 모드: 숏 슬롯의 매도 = 숏 진입
        assert_eq!(
            PositionEffect::Open.target_side(Side::Sell, 2),
            PositionSide::Short
        );
        // 롱 슬롯의 매도 = 롱 청산
        assert_eq!(
            PositionEffect::Close.target_side(Side::Sell, 1),
            PositionSide::Long
        );
    }

    #[test]
    fn test_exchange_kind_parse() {
        assert_eq!("Bybit".parse::<ExchangeKind>().unwrap(), ExchangeKind::Bybit);
        assert!("okx".parse::<ExchangeKind>().is_err());
        assert!(ExchangeKind::Bitget.requires_passphrase());
        assert!(!ExchangeKind::Binance.requires_passphrase());
    }
}
