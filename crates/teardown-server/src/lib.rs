pub mod actors;
pub mod dispatcher;
pub mod routes;
pub mod state;

pub use actors::{Actor, ActorRegistry};
pub use state::{AppState, Connection};
