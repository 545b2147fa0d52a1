pub mod appointments;
pub mod audit_logs;
pub mod patients;
pub mod users;
