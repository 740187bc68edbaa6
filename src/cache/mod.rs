//! Shared read caches: prices and gas.

pub mod gas_cache;
pub mod price_cache;

pub use gas_cache::{gas_cost_usd, GasCache};
pub use price_cache::{PriceCache, QuoteKey, MAX_AGE_BLOCKS};
