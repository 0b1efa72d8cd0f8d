pub mod order;
pub mod proposal;

pub use order::{OrderEngine, PaymentPolicy};
pub use proposal::{ProposalEngine, PROPOSAL_TTL_DAYS};
