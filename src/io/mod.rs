pub mod conflation;
pub mod csv;
pub mod geojson;
pub mod rating_db;
pub mod results;
