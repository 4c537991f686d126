pub mod book;
pub mod engine;
pub mod streams;
pub mod tape;

pub use book::{BookTop, DeltaOutcome, DepthEvent};
pub use engine::MarketDataEngine;
pub use tape::{AggTrade, BestQuote};
