//! cfopt kernel: scheduled Cloudflare IP speed tests, a best-IP API and
//! propagation of the winner into hosts files and DNS rewrite rules.

pub mod config;
pub mod guard;
pub mod heartbeat;
pub mod http;
pub mod models;
pub mod optimizer;
pub mod parser;
pub mod propagation;
pub mod ranges;
pub mod scheduler;
pub mod state;
