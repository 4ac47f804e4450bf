//! Handler Set (spec §3/§6): one module per task family, each a set of free
//! functions taking `&Arc<EngineContext>` rather than a struct with methods
//! -- there is no per-handler state beyond what `EngineContext` already
//! holds, so a struct wrapper would add nothing over the module boundary.

pub mod backup;
pub mod contacts;
pub mod feed;
pub mod groups;
pub mod identity;
pub mod messaging;
pub mod profile;
