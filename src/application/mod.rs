// Application layer - ledger use cases, identity resolution and the
// collaborator seams (access guard) they depend on.

pub mod error;
pub mod guard;
pub mod identity;
pub mod service;
pub mod views;

pub use error::*;
pub use guard::*;
pub use identity::*;
pub use service::*;
pub use views::*;
