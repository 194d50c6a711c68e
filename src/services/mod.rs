pub mod crops;
pub mod error;
pub mod export;
pub mod labels;
pub mod session;
