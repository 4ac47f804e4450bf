pub mod addressbook;
pub mod dht;
pub mod error;
pub mod facade;
pub mod messaging;
pub mod node;
pub mod profile;

pub use addressbook::{build_addressbook_record, verify_addressbook_record, AddressbookEntry, AddressbookRecord};
pub use error::ProtocolError;
pub use facade::{CleanupCallback, DhtFacade, FakeDhtFacade, ListenerToken, ValueCallback, VeilidDhtFacade};
pub use node::EngineNode;
pub use profile::{build_profile_record, verify_profile_record, ProfileRecord};
