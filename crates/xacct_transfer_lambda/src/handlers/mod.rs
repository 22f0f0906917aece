pub mod executor;
pub mod lister;
pub mod orchestrator;
pub mod reporter;
pub mod start;
pub mod validator;
