mod cache;
mod defaults;
mod error;
mod fallback;
mod fetcher;
mod jsonl_store;
mod models;
pub mod providers;
mod rate_limiter;
mod source;
mod store;

pub use cache::{QuoteCache, DEFAULT_CACHE_TTL};
pub use defaults::{default_prices, default_quote};
pub use error::{classify_status, retry_after, FetchError, FetchExhausted};
pub use fallback::QuoteFallback;
pub use fetcher::{RetryPolicy, RetryingFetcher};
pub use jsonl_store::JsonlQuoteStore;
pub use models::{CurrencyPair, MarginSettings, Provenance, Quote, RefreshState, SourceId};
pub use rate_limiter::{CooldownConfig, RateLimiter};
pub use source::{median, RateSource, RawProviderResult};
pub use store::{MemoryQuoteStore, NullQuoteStore, QuoteStore};
