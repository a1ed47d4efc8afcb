pub mod bundle_reader;
pub mod response_writer;
