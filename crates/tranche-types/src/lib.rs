pub mod actor;
pub mod address;
pub mod amount;
pub mod error;
pub mod file;
pub mod id;

pub use actor::{ActorContext, ActorRole};
pub use address::{ContractAddress, WalletAddress};
pub use amount::{TokenUnits, UsdAmount, USD_DECIMALS};
pub use error::{EscrowError, Result};
pub use file::FileRef;
pub use id::{BidId, ProposalId, RequestId, TxHash};
