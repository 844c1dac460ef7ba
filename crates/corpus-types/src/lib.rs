/*!
Shared contract types of the corpus engine.

This crate defines everything a plugin module author needs: the three
module traits ([`modules::ResourceModule`], [`modules::PreprocessingModule`]
and [`modules::IndexModule`]), the records flowing through them, the
cancellation token polled between observable side effects, and the typed
observability events surfaced to a listener.

The ingestion core lives in the `ingest-scheduler` crate; nothing in here
touches a database.
*/

pub mod events;
pub mod hash;
pub mod interruption;
pub mod modules;
pub mod resources;

/// Identifier of a registered knowledge base.
pub type BaseId = u32;

/// Identifier carried by resource events and propagated to derived tasks.
///
/// Resource modules allocate these; `-1` is used by the engine for
/// synthetic submissions that have no originating event.
pub type EventId = i64;
