// Library interface for newsposter modules
// This allows tests and the binaries to import modules

pub mod dedup;
pub mod events;
pub mod images;
pub mod llm;
pub mod pipeline;
pub mod publish;
pub mod retry;
pub mod sources;
pub mod store;
pub mod time_window;
