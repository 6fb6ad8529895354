//! Value objects - immutable identifier types shared by every subsystem

mod snowflake;
mod snowflake_list;

pub use snowflake::{snowflake_time, time_snowflake, Snowflake, SnowflakeParseError};
pub use snowflake_list::SnowflakeList;
