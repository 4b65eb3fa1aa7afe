pub mod error;
pub mod layout;
pub mod schema;
pub mod settings;
pub mod store;

pub use error::{Result, StoreError};
pub use layout::DataDir;
pub use settings::{RosterEntry, Settings};
pub use store::Store;
