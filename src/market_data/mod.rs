pub mod book_ticker;
pub mod candle_buffer;
pub mod price_feed;

// Re-export the Candle struct for convenient access (e.g. `use crate::market_data::Candle`).
pub use book_ticker::BookTickerFeed;
pub use candle_buffer::{Candle, CandleBuffer, CandleKey};
pub use price_feed::{PriceFeed, PriceTick};
