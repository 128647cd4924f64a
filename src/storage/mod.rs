pub mod influx;

pub use influx::{DataPoint, FieldValue, InfluxConfig, InfluxWriter};
