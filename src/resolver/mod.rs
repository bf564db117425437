//! Metric-to-host resolution and rebalancing.

mod assignments;
mod balanced;

pub use assignments::AssignmentRow;
pub use balanced::BalancedResolver;
