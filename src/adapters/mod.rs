pub mod api;
pub mod db;
pub mod mqtt;
pub mod sensor_debug_file;
