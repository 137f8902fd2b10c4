pub mod arena;
pub mod patcher;
pub mod protect;
