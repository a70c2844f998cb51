pub mod circuit_states;
pub mod health_records;
pub mod request_logs;
pub mod upstreams;

pub use circuit_states::Entity as CircuitStates;
pub use health_records::Entity as HealthRecords;
pub use request_logs::Entity as RequestLogs;
pub use upstreams::Entity as Upstreams;
