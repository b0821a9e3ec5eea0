#[allow(unused)]
pub mod server;
