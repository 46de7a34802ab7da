pub mod sampler;

pub use sampler::{
    base_price, is_supported, Action, GeneratedSignal, SignalSampler, SignalSource, Trend, SYMBOLS,
};
