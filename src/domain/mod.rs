mod account;
mod category;
mod ledger;
mod money;
mod recurrence;
mod transaction;
mod user;

pub use account::*;
pub use category::*;
pub use ledger::*;
pub use money::*;
pub use recurrence::*;
pub use transaction::*;
pub use user::*;
