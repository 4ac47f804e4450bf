//! Feed/forum content model: out of scope, an external collaborator (spec
//! §1). The public API surface still advertises a feed family alongside
//! identity/contacts/messaging/groups/profile/backup, so every feed-family
//! request routed here gets one consistent, explicit answer rather than a
//! silent no-op or a `NotFound` that looks like a missing record.

use crate::error::EngineError;

pub fn unsupported() -> EngineError {
    EngineError::Internal("feed/forum content is not part of this engine; see DESIGN.md".into())
}
