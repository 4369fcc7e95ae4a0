pub mod record_writer;
