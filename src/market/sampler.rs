use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

// Symbol catalogue with base reference prices
pub const SYMBOLS: &[(&str, f64)] = &[
    ("BTC/USD", 42_000.0),
    ("ETH/USD", 2_200.0),
    ("SOL/USD", 98.0),
];

const VOLATILITY: f64 = 0.02;
const MIN_CONFIDENCE: f64 = 0.3;
const MAX_CONFIDENCE: f64 = 0.95;
const MAX_VOLUME: f64 = 1_000_000.0;

pub fn base_price(symbol: &str) -> Option<f64> {
    SYMBOLS
        .iter()
        .find(|(name, _)| *name == symbol)
        .map(|(_, price)| *price)
}

pub fn is_supported(symbol: &str) -> bool {
    base_price(symbol).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "BUY" => Some(Action::Buy),
            "SELL" => Some(Action::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trend {
    StrongUp,
    Up,
    Sideways,
    Down,
    StrongDown,
}

impl Trend {
    pub fn classify(price: f64, base_price: f64) -> Self {
        let change = (price - base_price) / base_price * 100.0;
        if change > 1.0 {
            Trend::StrongUp
        } else if change > 0.2 {
            Trend::Up
        } else if change < -1.0 {
            Trend::StrongDown
        } else if change < -0.2 {
            Trend::Down
        } else {
            Trend::Sideways
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSignal {
    pub symbol: String,
    pub action: Action,
    pub price: f64,
    pub confidence: f64,
    pub trend: Trend,
    // Unix epoch milliseconds
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
}

// Produces one signal per call for a symbol; swap in a real feed by
// implementing this for another type.
pub trait SignalSource: Send + Sync {
    fn sample(&self, symbol: &str) -> Option<GeneratedSignal>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SignalSampler;

impl SignalSampler {
    pub fn new() -> Self {
        Self
    }

    // Random walk around the base price. `shift`, `strength` and `volume_ratio`
    // are uniform draws in [0, 1).
    pub fn sample_with(
        symbol: &str,
        base_price: f64,
        shift: f64,
        strength: f64,
        volume_ratio: f64,
    ) -> GeneratedSignal {
        let price = round_cents(base_price + base_price * VOLATILITY * (shift - 0.5));
        let deviation = ((price - base_price) / base_price).abs();
        let confidence = ((strength + (1.0 - deviation)) / 2.0).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);
        let action = if price > base_price { Action::Buy } else { Action::Sell };

        GeneratedSignal {
            symbol: symbol.to_string(),
            action,
            price,
            confidence,
            trend: Trend::classify(price, base_price),
            timestamp: Utc::now().timestamp_millis(),
            volume: Some((volume_ratio * MAX_VOLUME).round() as u64),
        }
    }
}

impl SignalSource for SignalSampler {
    fn sample(&self, symbol: &str) -> Option<GeneratedSignal> {
        let base = base_price(symbol)?;
        let mut rng = rand::thread_rng();
        Some(Self::sample_with(
            symbol,
            base,
            rng.gen::<f64>(),
            rng.gen::<f64>(),
            rng.gen::<f64>(),
        ))
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_lookup() {
        assert_eq!(base_price("BTC/USD"), Some(42_000.0));
        assert_eq!(base_price("SOL/USD"), Some(98.0));
        assert!(!is_supported("DOGE/USD"));
    }

    #[test]
    fn test_price_moves_at_most_one_percent() {
        let low = SignalSampler::sample_with("BTC/USD", 42_000.0, 0.0, 0.5, 0.5);
        let high = SignalSampler::sample_with("BTC/USD", 42_000.0, 0.999_999, 0.5, 0.5);
        assert_eq!(low.price, 41_580.0);
        assert!(high.price <= 42_420.0 && high.price > 42_000.0);
        assert_eq!(low.action, Action::Sell);
        assert_eq!(high.action, Action::Buy);
    }

    #[test]
    fn test_unchanged_price_is_a_sell() {
        let signal = SignalSampler::sample_with("ETH/USD", 2_200.0, 0.5, 0.5, 0.0);
        assert_eq!(signal.price, 2_200.0);
        assert_eq!(signal.action, Action::Sell);
        assert_eq!(signal.trend, Trend::Sideways);
        assert_eq!(signal.volume, Some(0));
    }

    #[test]
    fn test_confidence_is_clamped() {
        let strong = SignalSampler::sample_with("ETH/USD", 2_200.0, 0.5, 0.999, 0.1);
        assert_eq!(strong.confidence, 0.95);

        let weak = SignalSampler::sample_with("ETH/USD", 2_200.0, 0.0, 0.0, 0.1);
        assert!(weak.confidence >= 0.3);
        assert!((weak.confidence - 0.495).abs() < 1e-9);
    }

    #[test]
    fn test_trend_thresholds() {
        assert_eq!(Trend::classify(102.0, 100.0), Trend::StrongUp);
        assert_eq!(Trend::classify(100.5, 100.0), Trend::Up);
        assert_eq!(Trend::classify(100.1, 100.0), Trend::Sideways);
        assert_eq!(Trend::classify(99.5, 100.0), Trend::Down);
        assert_eq!(Trend::classify(98.0, 100.0), Trend::StrongDown);
    }

    #[test]
    fn test_sampler_rejects_unknown_symbol() {
        let sampler = SignalSampler::new();
        assert!(sampler.sample("DOGE/USD").is_none());

        let signal = sampler.sample("SOL/USD").unwrap();
        assert_eq!(signal.symbol, "SOL/USD");
        assert!(signal.confidence >= 0.3 && signal.confidence <= 0.95);
        assert!((signal.price - 98.0).abs() <= 0.99);
    }

    #[test]
    fn test_signal_serializes_wire_names() {
        let signal = SignalSampler::sample_with("BTC/USD", 42_000.0, 0.9, 0.5, 0.5);
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["action"], "BUY");
        assert_eq!(json["trend"], "UP");
        assert_eq!(json["symbol"], "BTC/USD");
    }
}
