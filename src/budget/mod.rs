//! Rate-limit budget management.
//!
//! GitHub caps each credential's GraphQL usage per rolling hour. This module
//! keeps a local ledger of that allowance so the traversal engine can decide,
//! before every fetch, whether the fetch is affordable.
//!
//! # Overview
//!
//! - **BudgetConfig**: hourly node and request caps
//! - **BudgetTracker**: reserve / commit / release accounting against the current window
//! - **SharedBudget**: one tracker shared by every traversal on the same credential
//! - **Clock**: injectable time source (`SystemClock`, `ManualClock`)
//! - **RateLimitSnapshot**: the server's own accounting, parsed from responses
//!
//! # Example
//!
//! ```ignore
//! use ghwalk::budget::{Admission, BudgetConfig, BudgetTracker, Cost};
//!
//! let mut tracker = BudgetTracker::new(BudgetConfig::default());
//!
//! if let Admission::Admitted(reservation) = tracker.reserve(Cost::single_request(101)) {
//!     // ... issue the request ...
//!     tracker.commit(reservation, Cost::single_request(57));
//! }
//! ```

mod clock;
mod config;
mod parser;
mod shared;
mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BudgetConfig, DEFAULT_NODE_CAP, DEFAULT_REQUEST_CAP, DEFAULT_WINDOW_SECS};
pub use parser::{extract_or_count, ParsedCost, RateLimitSnapshot};
pub use shared::SharedBudget;
pub use tracker::{Admission, BudgetTracker, BudgetWindow, Cost, Reservation};
