mod manager;
mod registry;

pub use manager::{
    generate_session_id, validate_session_id, SessionHealth, SessionManager, EXEC_WINDOW,
};
pub use registry::{HealthStatus, SessionRegistry};
