pub mod config;
pub mod database_ops;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod pdb;
pub mod wiki;

pub mod util {
    pub mod env;
}
