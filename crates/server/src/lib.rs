pub mod server;

pub use server::{create_server, AppState, DispatchOnFlush};
