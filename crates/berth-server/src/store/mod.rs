pub mod access_tokens;
pub mod secret;
pub mod sessions;
pub mod table;

pub use access_tokens::{AccessTokenRecord, AccessTokenStore, AccessTokenSummary, IssuedSecret};
pub use sessions::{SessionRecord, SessionStore, SessionSummary};
pub use table::{EntryId, Filter, KeyedTable, Medium, Record, RecordKind};
