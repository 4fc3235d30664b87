//! SeaORM entity definitions for PostgreSQL database.

pub mod run_record;
