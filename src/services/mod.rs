//! Pipeline services: chunk reassembly, the bulk upsert engine, and the
//! import orchestrator that ties decoders and importers together.

pub mod bulk;
pub mod chunks;
pub mod orchestrator;
