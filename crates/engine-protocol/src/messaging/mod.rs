pub mod envelope;
pub mod receiver;

pub use envelope::{EnvelopeKind, GroupRosterEntry, MessageEnvelope, MessagePayload, CONTACT_REQUEST_ACCEPTED};
pub use receiver::{open, open_group, process_contact_request, process_incoming};
