//! Runner link: the per-session WebSocket between the control plane and the
//! sandboxed runner.

mod ws;

pub use ws::runner_ws_handler;
