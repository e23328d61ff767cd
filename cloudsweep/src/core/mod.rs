/*!
Core architecture modules for the cloud-sync cleanup daemon
*/

pub mod config;
pub mod detection_engine;
pub mod event_system;
pub mod modules;
pub mod nosync;
pub mod quarantine;
pub mod report;
pub mod state_manager;
pub mod sync_status;
pub mod tracker;
pub mod walk;
