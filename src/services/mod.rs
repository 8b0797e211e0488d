// SPDX-License-Identifier: MIT

//! Service layer: identity adapter, auth state machine, guards, rate
//! limiting, funnel analytics, and session bookkeeping.

pub mod context;
pub mod funnel;
pub mod guards;
pub mod identity;
pub mod rate_limit;
pub mod session_store;
pub mod sessions;
