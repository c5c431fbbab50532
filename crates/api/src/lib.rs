//! HTTP/websocket wiring for the trip event fabric.
//!
//! Deliberately thin: authentication happens upstream (the verified
//! principal id arrives in a header), persistence sits behind the store
//! traits, and all interesting behavior lives in the component crates.

pub mod connection;
pub mod routes;
pub mod server;
pub mod state;

pub use server::Server;
pub use state::AppState;
