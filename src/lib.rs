pub mod aggregate;
pub mod billing;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod platform;
pub mod retry;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::BillingConfig;
pub use error::{BillingError, BillingResult, ErrorKind};
pub use platform::BillingPlatform;
