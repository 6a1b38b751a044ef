pub mod util;

mod group;
mod offline;
