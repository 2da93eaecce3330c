pub mod auth;
pub mod background;
pub mod config;
pub mod engine;
pub mod hours;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod util;
pub mod wal;
pub mod wire;
