//! Request routing: ordered, first-match prefix table.

pub mod route_table;

pub use route_table::{Route, RouteTable};
