pub mod session_expiry;
