pub mod frankfurter;
pub mod fx_broker;
pub mod p2p_exchange;

pub use frankfurter::FrankfurterRateSource;
pub use fx_broker::FxBrokerSource;
pub use p2p_exchange::P2pExchangeSource;
