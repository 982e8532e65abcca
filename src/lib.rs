pub mod bus;
pub mod clock;
pub mod config;
pub mod duration;
pub mod format;
pub mod margin;
pub mod market_data;
pub mod sync;
