pub mod clock;

pub use clock::{Clock, ManualClock, MarketClock, OffsetClock, SystemClock};
