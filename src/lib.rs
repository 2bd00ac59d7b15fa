pub mod configuration;
pub mod dispatcher;
pub mod dispatcher_worker;
pub mod domain;
pub mod expander;
pub mod party_directory;
pub mod request_api;
pub mod routes;
pub mod scheduler;
pub mod smtp;
pub mod startup;
pub mod store;
pub mod telemetry;
