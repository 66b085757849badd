// =============================================================================
// Derived series builders
// =============================================================================
//
// Pure functions over the store plus a writer. Each builder recomputes its
// series from scratch on every invocation and upserts the result under
// `source = "DERIVED"`; the idempotent upsert makes reruns harmless.
// =============================================================================

pub mod bill_rrp;
pub mod settlements;

pub use bill_rrp::upsert_bill_rrp_spread;
pub use settlements::upsert_weekly_net_settlements;
