pub mod gateway;
pub mod pool;
