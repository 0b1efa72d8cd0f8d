pub mod chat;
pub mod events;
pub mod listing;
pub mod order;
pub mod proposal;

pub use chat::*;
pub use events::*;
pub use listing::*;
pub use order::*;
pub use proposal::*;
