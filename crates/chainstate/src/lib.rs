//! Chain state: UTXO views, block index and block connection.

pub mod coins;
pub mod genesis;
pub mod index;
pub mod state;
pub mod undo;
pub mod validation;
pub mod view;

pub use coins::{Coin, Coins};
pub use genesis::build_genesis;
pub use index::{BlockIndex, ChainIndex};
pub use state::{ChainState, ChainStateError, FlushMode, FlushPolicy, TipChange};
pub use undo::{BlockUndo, SpentCoin};
pub use validation::{RejectKind, Rejection, ValidationState};
pub use view::{CoinsDb, CoinsError, CoinsView, CoinsViewCache};
